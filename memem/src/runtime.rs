//! Finding the runtime translation routine.

use parking_lot::Mutex;
use std::{collections::HashMap, ffi::CString};

/// Converts symbol names to addresses.
pub trait SymbolResolver {
    fn resolve(&self, sym: &str) -> Option<usize>;
}

/// Resolves symbols in the current process: effectively a caching front-end to [libc::dlsym].
#[derive(Default)]
pub struct DlsymResolver {
    cache: Mutex<HashMap<String, Option<usize>>>,
}

impl DlsymResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SymbolResolver for DlsymResolver {
    fn resolve(&self, sym: &str) -> Option<usize> {
        let mut cache = self.cache.lock();
        if let Some(x) = cache.get(sym) {
            return *x;
        }
        // A name with an interior NUL can't be a symbol.
        let r = CString::new(sym).ok().and_then(|cn| {
            let ptr = unsafe { libc::dlsym(std::ptr::null_mut(), cn.as_c_str().as_ptr()) };
            if ptr.is_null() {
                None
            } else {
                Some(ptr.addr())
            }
        });
        cache.insert(sym.to_owned(), r);
        r
    }
}

/// A fixed symbol table, for when the routine lives somewhere other than the current process.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    syms: HashMap<String, usize>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sym: &str, addr: usize) -> Self {
        self.syms.insert(sym.to_owned(), addr);
        self
    }
}

impl SymbolResolver for StaticResolver {
    fn resolve(&self, sym: &str) -> Option<usize> {
        self.syms.get(sym).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dlsym() {
        let r = DlsymResolver::new();
        let a = r.resolve("malloc").unwrap();
        assert_eq!(r.resolve("malloc"), Some(a));
        assert_eq!(r.resolve("__memem_no_such_symbol"), None);
        assert_eq!(r.resolve("a\0b"), None);
    }

    #[test]
    fn static_table() {
        let r = StaticResolver::new().with("f", 0x1234);
        assert_eq!(r.resolve("f"), Some(0x1234));
        assert_eq!(r.resolve("g"), None);
    }
}
