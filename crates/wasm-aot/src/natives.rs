//! Built-in native symbol tables for resolving `env.*` / `spectest.*`
//! imports against the host libc wrappers.
//!
//! Three tables exist: sandboxed 32-bit (pointer/size arguments are wasm
//! offsets, signature char `i`), sandboxed 64-bit (`64`-suffixed wrapper
//! names, signature char `I`), and no-sandbox (canonical host names,
//! native pointers). Lookup is a case-sensitive binary search over a
//! lazily sorted copy of the table.

use std::sync::OnceLock;

/// `(module, name, signature)`. Signatures use one character per
/// parameter/result: `i` = i32, `I` = i64, `f` = f32, `F` = f64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeSymbol {
    pub module_name: &'static str,
    pub field_name: &'static str,
    pub signature: &'static str,
}

const fn sym(module_name: &'static str, field_name: &'static str, signature: &'static str) -> NativeSymbol {
    NativeSymbol { module_name, field_name, signature }
}

const NATIVE_SYMBOLS_SPECTEST: &[NativeSymbol] = &[
    sym("spectest", "print", "()"),
    sym("spectest", "print_i32", "(i)"),
    sym("spectest", "print_i32_f32", "(if)"),
    sym("spectest", "print_f64_f64", "(FF)"),
    sym("spectest", "print_f32", "(f)"),
    sym("spectest", "print_f64", "(F)"),
];

const NATIVE_SYMBOLS_LIBC_BUILTIN: &[NativeSymbol] = &[
    sym("env", "printf", "(ii)i"),
    sym("env", "sprintf", "(iii)i"),
    sym("env", "snprintf", "(iiii)i"),
    sym("env", "vprintf", "(ii)i"),
    sym("env", "vsprintf", "(iii)i"),
    sym("env", "vsnprintf", "(iiii)i"),
    sym("env", "puts", "(i)i"),
    sym("env", "putchar", "(i)i"),
    sym("env", "memcmp", "(iii)i"),
    sym("env", "memcpy", "(iii)i"),
    sym("env", "memmove", "(iii)i"),
    sym("env", "memset", "(iii)i"),
    sym("env", "strchr", "(ii)i"),
    sym("env", "strcmp", "(ii)i"),
    sym("env", "strcpy", "(ii)i"),
    sym("env", "strlen", "(i)i"),
    sym("env", "strncmp", "(iii)i"),
    sym("env", "strncpy", "(iii)i"),
    sym("env", "malloc", "(i)i"),
    sym("env", "realloc", "(ii)i"),
    sym("env", "calloc", "(ii)i"),
    sym("env", "strdup", "(i)i"),
    sym("env", "free", "(i)"),
    sym("env", "atoi", "(i)i"),
    sym("env", "exit", "(i)"),
    sym("env", "strtol", "(iii)i"),
    sym("env", "strtoul", "(iii)i"),
    sym("env", "memchr", "(iii)i"),
    sym("env", "strncasecmp", "(iii)i"),
    sym("env", "strspn", "(ii)i"),
    sym("env", "strcspn", "(ii)i"),
    sym("env", "strstr", "(ii)i"),
    sym("env", "isupper", "(i)i"),
    sym("env", "isalpha", "(i)i"),
    sym("env", "isspace", "(i)i"),
    sym("env", "isgraph", "(i)i"),
    sym("env", "isprint", "(i)i"),
    sym("env", "isdigit", "(i)i"),
    sym("env", "isxdigit", "(i)i"),
    sym("env", "tolower", "(i)i"),
    sym("env", "toupper", "(i)i"),
    sym("env", "isalnum", "(i)i"),
    sym("env", "abort", "(i)"),
    sym("env", "fwrite", "(iiii)i"),
    sym("env", "clock_gettime", "(ii)i"),
    sym("env", "clock", "()I"),
];

const NATIVE_SYMBOLS_LIBC64_BUILTIN: &[NativeSymbol] = &[
    sym("env", "printf64", "(II)i"),
    sym("env", "sprintf64", "(III)i"),
    sym("env", "snprintf64", "(IIII)i"),
    sym("env", "vprintf64", "(II)i"),
    sym("env", "vsprintf64", "(III)i"),
    sym("env", "vsnprintf64", "(IIII)i"),
    sym("env", "puts64", "(I)i"),
    sym("env", "putchar64", "(i)i"),
    sym("env", "memcmp64", "(III)i"),
    sym("env", "memcpy64", "(III)I"),
    sym("env", "memmove64", "(III)I"),
    sym("env", "memset64", "(IiI)I"),
    sym("env", "strchr64", "(Ii)I"),
    sym("env", "strcmp64", "(II)i"),
    sym("env", "strcpy64", "(II)I"),
    sym("env", "strlen64", "(I)I"),
    sym("env", "strncmp64", "(III)i"),
    sym("env", "strncpy64", "(III)I"),
    sym("env", "malloc64", "(I)I"),
    sym("env", "realloc64", "(II)I"),
    sym("env", "calloc64", "(II)I"),
    sym("env", "strdup64", "(I)I"),
    sym("env", "free64", "(I)"),
    sym("env", "atoi64", "(I)i"),
    sym("env", "exit64", "(i)"),
    sym("env", "strtol64", "(IIi)I"),
    sym("env", "strtoul64", "(IIi)I"),
    sym("env", "memchr64", "(IiI)I"),
    sym("env", "strncasecmp64", "(III)i"),
    sym("env", "strspn64", "(II)I"),
    sym("env", "strcspn64", "(II)I"),
    sym("env", "strstr64", "(II)I"),
    sym("env", "isupper64", "(i)i"),
    sym("env", "isalpha64", "(i)i"),
    sym("env", "isspace64", "(i)i"),
    sym("env", "isgraph64", "(i)i"),
    sym("env", "isprint64", "(i)i"),
    sym("env", "isdigit64", "(i)i"),
    sym("env", "isxdigit64", "(i)i"),
    sym("env", "tolower64", "(i)i"),
    sym("env", "toupper64", "(i)i"),
    sym("env", "isalnum64", "(i)i"),
    sym("env", "abort64", "(i)"),
    sym("env", "fwrite64", "(IIII)I"),
    sym("env", "clock_gettime64", "(iI)i"),
    sym("env", "clock64", "()I"),
];

const NATIVE_SYMBOLS_LIBC64_NOSANDBOX: &[NativeSymbol] = &[
    sym("env", "printf", "(II)i"),
    sym("env", "sprintf", "(III)i"),
    sym("env", "snprintf", "(IIII)i"),
    sym("env", "vprintf", "(II)i"),
    sym("env", "vsprintf", "(III)i"),
    sym("env", "vsnprintf", "(IIII)i"),
    sym("env", "vasprintf", "(III)i"),
    sym("env", "fwrite", "(IIII)I"),
    sym("env", "fprintf", "(III)i"),
    sym("env", "fclose", "(I)i"),
    sym("env", "fputc", "(iI)i"),
    sym("env", "fputs", "(II)i"),
    sym("env", "sscanf", "(III)i"),
    sym("env", "__assert2", "(IiII)"),
    sym("env", "__errno", "()I"),
    sym("env", "log", "(F)F"),
];

fn sorted(table: &[NativeSymbol]) -> Vec<NativeSymbol> {
    let mut v = table.to_vec();
    v.sort_by(|a, b| {
        a.module_name
            .cmp(b.module_name)
            .then_with(|| a.field_name.cmp(b.field_name))
    });
    v
}

fn sandbox32_table() -> &'static [NativeSymbol] {
    static TABLE: OnceLock<Vec<NativeSymbol>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut v = sorted(NATIVE_SYMBOLS_LIBC_BUILTIN);
        v.extend_from_slice(&sorted(NATIVE_SYMBOLS_SPECTEST));
        // spectest entries sort after env, so the concatenation stays
        // ordered by (module, field).
        v
    })
}

fn sandbox64_table() -> &'static [NativeSymbol] {
    static TABLE: OnceLock<Vec<NativeSymbol>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut v = sorted(NATIVE_SYMBOLS_LIBC64_BUILTIN);
        v.extend_from_slice(&sorted(NATIVE_SYMBOLS_SPECTEST));
        v
    })
}

fn nosandbox_table() -> &'static [NativeSymbol] {
    static TABLE: OnceLock<Vec<NativeSymbol>> = OnceLock::new();
    TABLE.get_or_init(|| sorted(NATIVE_SYMBOLS_LIBC64_NOSANDBOX))
}

/// Look up a native import by `(module, field)` in the table selected by
/// sandbox mode and memory width.
#[must_use]
pub fn lookup(
    module_name: &str,
    field_name: &str,
    is_memory64: bool,
    no_sandbox_mode: bool,
) -> Option<&'static NativeSymbol> {
    let table = if no_sandbox_mode {
        nosandbox_table()
    } else if is_memory64 {
        sandbox64_table()
    } else {
        sandbox32_table()
    };
    table
        .binary_search_by(|s| {
            s.module_name
                .cmp(module_name)
                .then_with(|| s.field_name.cmp(field_name))
        })
        .ok()
        .map(|i| &table[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox32_lookup() {
        let s = lookup("env", "printf", false, false).unwrap();
        assert_eq!(s.signature, "(ii)i");
        let s = lookup("spectest", "print_i32", false, false).unwrap();
        assert_eq!(s.signature, "(i)");
    }

    #[test]
    fn sandbox64_uses_suffixed_names() {
        assert!(lookup("env", "printf", true, false).is_none());
        let s = lookup("env", "printf64", true, false).unwrap();
        assert_eq!(s.signature, "(II)i");
    }

    #[test]
    fn nosandbox_uses_host_names() {
        let s = lookup("env", "printf", false, true).unwrap();
        assert_eq!(s.signature, "(II)i");
        assert!(lookup("env", "printf64", false, true).is_none());
    }

    #[test]
    fn unknown_symbol() {
        assert!(lookup("env", "not_a_symbol", false, false).is_none());
    }
}
