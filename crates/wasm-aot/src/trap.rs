//! Runtime exception ids and messages.
//!
//! Every failure path inside an emitted function stores one of these ids
//! into the `exception_id` global and returns a zero value; host callers
//! read it back through `wasm_get_exception`. The numeric values are part
//! of the runtime ABI and must stay stable.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExceptionId {
    Unreachable = -100,
    OutOfBoundsMemoryAccess = -99,
    OutOfBoundsTableAccess = -98,
    IntegerOverflow = -97,
    IntegerDivideByZero = -96,
    InvalidConversionToInteger = -95,
    InvalidFunctionTypeIndex = -94,
    UndefinedElement = -93,
    UninitializedElement = -92,
    CallUnlinkedImportFunc = -91,
    NativeStackOverflow = -90,
    UnalignedAtomic = -89,
    AuxStackOverflow = -88,
    AuxStackUnderflow = -87,
    AllocateMemoryFailed = -86,
    LookupEntrySymbolFailed = -85,
    LookupFunctionFailed = -84,
    InvalidInputArgumentCount = -83,
    InvalidInputArgument = -82,
    HostManagedHeapNotFound = -81,
    QuickCallEntryNotFound = -80,
    UnknownError = -79,
}

pub const EXCEPTION_ID_MIN: i32 = ExceptionId::Unreachable as i32;
pub const EXCEPTION_ID_MAX: i32 = ExceptionId::UnknownError as i32;

/// Messages indexed by `id - EXCEPTION_ID_MIN`, mirrored into the emitted
/// `exception_msgs` global.
pub const EXCEPTION_MSGS: [&str; 22] = [
    "unreachable",
    "out of bounds memory access",
    "out of bounds table access",
    "integer overflow",
    "integer divide by zero",
    "invalid conversion to integer",
    "indirect call type mismatch",
    "undefined element",
    "uninitialized element",
    "failed to call unlinked import function",
    "native stack overflow",
    "unaligned atomic",
    "wasm auxiliary stack overflow",
    "wasm auxiliary stack underflow",
    "allocate memory failed",
    "lookup entry symbol failed",
    "lookup function failed",
    "invalid input argument count",
    "invalid input argument",
    "host managed heap not found",
    "quick call entry not found",
    "unknown error",
];

impl ExceptionId {
    #[must_use]
    pub fn message(self) -> &'static str {
        EXCEPTION_MSGS[(self as i32 - EXCEPTION_ID_MIN) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_cover_the_message_table() {
        assert_eq!(
            (EXCEPTION_ID_MAX - EXCEPTION_ID_MIN + 1) as usize,
            EXCEPTION_MSGS.len()
        );
        assert_eq!(ExceptionId::Unreachable.message(), "unreachable");
        assert_eq!(
            ExceptionId::IntegerDivideByZero.message(),
            "integer divide by zero"
        );
        assert_eq!(ExceptionId::UnknownError.message(), "unknown error");
    }
}
