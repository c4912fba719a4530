pub mod folded;
