use std::sync::OnceLock;

use pytail_common::python::state::Symbol;
use regex::Regex;

/// Bytes up to the first NUL, lossily decoded.
pub fn cstr(buf: &[u8]) -> String {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Human-readable name for a deduplicated Python symbol:
/// `module.Class.function (path)`, with the class and path parts optional.
pub fn display_name(sym: &Symbol) -> String {
    let name = cstr(&sym.name);
    let classname = cstr(&sym.classname);
    let file = cstr(&sym.file);

    let qualified = if classname.is_empty() {
        name
    } else {
        format!("{classname}.{name}")
    };

    if file.is_empty() {
        return qualified;
    }
    format!("{}.{} ({})", module_from_path(&file), qualified, file)
}

/// Reduce a source path to a module-ish dotted name: strip the common
/// install prefixes and the extension, then join with dots.
fn module_from_path(file: &str) -> String {
    static PREFIX_RE: OnceLock<Regex> = OnceLock::new();
    static LIB_RE: OnceLock<Regex> = OnceLock::new();
    static EXT_RE: OnceLock<Regex> = OnceLock::new();
    let prefix_re =
        PREFIX_RE.get_or_init(|| Regex::new(r"^(/opt|/usr(/local)?)").unwrap());
    let lib_re = LIB_RE.get_or_init(|| {
        Regex::new(r"^/lib/python[23](\.[0-9]+)?(/(site|dist)-packages)?").unwrap()
    });
    let ext_re = EXT_RE.get_or_init(|| Regex::new(r"\.(py|pyc|pyo)$").unwrap());

    let s = prefix_re.replace(file, "").into_owned();
    let s = lib_re.replace(&s, "").into_owned();
    let s = s.strip_prefix('/').unwrap_or(&s).to_string();
    let s = ext_re.replace(&s, "").into_owned();
    s.replace('/', ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pytail_common::python::state::{CLASS_NAME_LEN, FILE_NAME_LEN, FUNCTION_NAME_LEN};

    fn symbol(classname: &str, name: &str, file: &str) -> Symbol {
        let mut sym = Symbol::default();
        sym.classname[..classname.len()].copy_from_slice(classname.as_bytes());
        sym.name[..name.len()].copy_from_slice(name.as_bytes());
        sym.file[..file.len()].copy_from_slice(file.as_bytes());
        assert!(classname.len() < CLASS_NAME_LEN);
        assert!(name.len() < FUNCTION_NAME_LEN);
        assert!(file.len() < FILE_NAME_LEN);
        sym
    }

    #[test]
    fn method_with_class_and_file() {
        let sym = symbol("Widget", "method_name", "/home/app/file.py");
        assert_eq!(
            display_name(&sym),
            "home.app.file.Widget.method_name (/home/app/file.py)"
        );
    }

    #[test]
    fn global_function_without_class() {
        let sym = symbol("", "main", "/srv/job.py");
        assert_eq!(display_name(&sym), "srv.job.main (/srv/job.py)");
    }

    #[test]
    fn no_file_keeps_the_bare_name() {
        let sym = symbol("", "inner", "");
        assert_eq!(display_name(&sym), "inner");
    }

    #[test]
    fn site_packages_prefix_is_stripped() {
        let sym = symbol(
            "",
            "get",
            "/usr/lib/python3.8/site-packages/requests/api.py",
        );
        assert_eq!(
            display_name(&sym),
            "requests.api.get (/usr/lib/python3.8/site-packages/requests/api.py)"
        );
    }

    #[test]
    fn dist_packages_and_local_prefixes() {
        assert_eq!(
            module_from_path("/usr/local/lib/python2.7/dist-packages/flask/app.py"),
            "flask.app"
        );
        assert_eq!(module_from_path("/opt/lib/python3.10/tool.pyc"), "tool");
    }
}
