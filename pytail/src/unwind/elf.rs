use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use memmap2::Mmap;
use object::{Object, ObjectSymbol, SymbolKind};
use symbolic::demangle::demangle;

/// Function symbols of one ELF file, keyed by svma for nearest-below lookup.
/// Names are demangled once at build time.
#[derive(Debug)]
pub struct ElfSymbols {
    map: BTreeMap<u64, String>,
}

impl ElfSymbols {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let obj = object::File::parse(&*mmap)?;

        let mut map = BTreeMap::new();
        for sym in obj.dynamic_symbols().chain(obj.symbols()) {
            if sym.kind() != SymbolKind::Text || sym.address() == 0 {
                continue;
            }
            let Ok(name) = sym.name() else { continue };
            if name.is_empty() {
                continue;
            }
            map.entry(sym.address())
                .or_insert_with(|| demangle(name).into_owned());
        }

        Ok(Self { map })
    }

    pub fn find(&self, svma: u64) -> Option<&str> {
        self.map
            .range(..=svma)
            .next_back()
            .map(|(_, name)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_returns_nearest_symbol_below() {
        let mut map = BTreeMap::new();
        map.insert(0x1000, "first".to_string());
        map.insert(0x2000, "second".to_string());
        let syms = ElfSymbols { map };

        assert_eq!(syms.find(0x1000), Some("first"));
        assert_eq!(syms.find(0x1fff), Some("first"));
        assert_eq!(syms.find(0x2000), Some("second"));
        assert_eq!(syms.find(0x9999), Some("second"));
        assert_eq!(syms.find(0xfff), None);
    }
}
