/// Result of one `execute` or `resume` call.
///
/// Runtime conditions never panic; they end the run with an error status
/// whose numeric code the host translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitStatus {
    Success = 0,
    /// Suspended by `yield`; call `resume` to continue.
    Yield = 1,
    ErrorMaxIterations = -1,
    ErrorUnsupportedOperationInRoot = -2,
    ErrorAssignVectorSizeMismatch = -3,
    ErrorStackUnderflow = -4,
    ErrorStackOverflow = -5,
    ErrorUnresolvedFunctionId = -6,
    ErrorVectorSizeOverflow = -7,
    ErrorStackTypeMismatch = -8,
    ErrorUnknownOperation = -9,
    ErrorInvalidPackage = -10,
    ErrorNotSuspended = -11,
}

impl ExitStatus {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn from_code(code: i32) -> Option<ExitStatus> {
        let status = match code {
            0 => ExitStatus::Success,
            1 => ExitStatus::Yield,
            -1 => ExitStatus::ErrorMaxIterations,
            -2 => ExitStatus::ErrorUnsupportedOperationInRoot,
            -3 => ExitStatus::ErrorAssignVectorSizeMismatch,
            -4 => ExitStatus::ErrorStackUnderflow,
            -5 => ExitStatus::ErrorStackOverflow,
            -6 => ExitStatus::ErrorUnresolvedFunctionId,
            -7 => ExitStatus::ErrorVectorSizeOverflow,
            -8 => ExitStatus::ErrorStackTypeMismatch,
            -9 => ExitStatus::ErrorUnknownOperation,
            -10 => ExitStatus::ErrorInvalidPackage,
            -11 => ExitStatus::ErrorNotSuspended,
            _ => return None,
        };
        Some(status)
    }

    pub const fn is_error(self) -> bool {
        (self as i32) < 0
    }

    pub const fn message(self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::Yield => "suspended by yield",
            ExitStatus::ErrorMaxIterations => "iteration limit exceeded",
            ExitStatus::ErrorUnsupportedOperationInRoot => "unsupported operation at statement level",
            ExitStatus::ErrorAssignVectorSizeMismatch => "assigned value does not match the target size",
            ExitStatus::ErrorStackUnderflow => "stack underflow",
            ExitStatus::ErrorStackOverflow => "stack overflow",
            ExitStatus::ErrorUnresolvedFunctionId => "unresolved function id",
            ExitStatus::ErrorVectorSizeOverflow => "vector grows past 4 components",
            ExitStatus::ErrorStackTypeMismatch => "stack type mismatch",
            ExitStatus::ErrorUnknownOperation => "unknown operation",
            ExitStatus::ErrorInvalidPackage => "invalid package",
            ExitStatus::ErrorNotSuspended => "package is not suspended",
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}
