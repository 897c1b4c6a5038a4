//! Error types and the diagnostic logger.

use crate::source::SourceSpan;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Informational note (e.g. overload candidates)
    Info,
    /// Suspicious but compilable
    Warn,
    /// Compilation fails
    Error,
    /// Internal tracing detail
    Debug,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Debug => write!(f, "debug"),
        }
    }
}

/// Stable diagnostic codes, grouped by layer.
///
/// Codes are part of the public surface: embedders match on them, so the
/// numeric values never change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Placeholder for "no error"
    NoError = 0,

    // lexer
    /// A character that begins no token
    UnknownToken = 101,
    /// String literal with no closing delimiter
    UnterminatedString = 102,
    /// Numeric literal that does not parse
    MalformedNumber = 103,

    // parser
    /// Expected an identifier
    ExpectedIdentifier = 201,
    /// Expected a type name
    ExpectedTypeIdentifier = 202,
    /// Expected a specific punctuation character
    ExpectedChar = 203,
    /// Expected an expression
    ExpectedExpression = 204,
    /// Token does not fit the current production
    UnexpectedToken = 205,
    /// Expected a specific keyword
    ExpectedKeyword = 206,
    /// Keyword not valid here
    UnexpectedKeyword = 207,
    /// Expected an operator
    ExpectedOperator = 208,
    /// Expected a class property or method
    ExpectedClassMember = 209,
    /// Ran out of tokens mid-production
    UnexpectedEof = 210,
    /// `import` without a path string
    ExpectedImportPath = 211,
    /// `import` without a symbol list
    ExpectedImportList = 212,
    /// Parameter list element missing
    ExpectedParameter = 213,
    /// Template argument missing
    ExpectedTemplateArg = 214,
    /// `try` without `catch`
    ExpectedCatchBlock = 215,
    /// `switch` body element that is not a case
    ExpectedSwitchCase = 216,
    /// Declaration keyword without a declarator
    ExpectedVariableDecl = 217,
    /// Function declared without a body
    ExpectedFunctionBody = 218,
    /// Numeric constant with a bad suffix/body combination
    MalformedNumericConstant = 219,

    // module graph
    /// Import path did not resolve to a file
    FailedToResolveModule = 251,
    /// Import cycle, message lists every frame
    CyclicImports = 252,
    /// Module has no symbol by that name
    SymbolNotFound = 253,

    // compiler: identifier resolution
    /// Name not found in any enclosing scope
    UndefinedIdentifier = 301,
    /// Name resolves to more than one symbol
    AmbiguousIdentifier = 302,
    /// Name used as a type but does not name one
    NotAType = 303,
    // compiler: templates
    /// Template argument count mismatch
    TemplateWrongArity = 310,
    /// Template arguments applied to a non-template
    NotATemplate = 311,
    /// Specialization recursion exceeded the depth limit
    TemplateDepthExceeded = 312,
    // compiler: visibility
    /// Private member accessed from outside its type
    PrivateAccess = 320,
    /// Non-static member referenced without an object
    NotStatic = 321,
    /// Assignment target is not writable
    NotWritable = 322,
    /// Read of a write-only property
    NotReadable = 323,
    // compiler: function matching
    /// No overload matches the argument list
    NoMatchingFunction = 330,
    /// More than one overload matches with no strict winner
    AmbiguousFunction = 331,
    /// Call with the wrong number of arguments
    WrongArgumentCount = 332,
    /// Note attached to a rejected candidate
    ArgumentConversion = 333,
    /// Function with identical signature already registered
    DuplicateFunction = 334,
    // compiler: control flow
    /// `break` outside a loop or switch
    BreakOutsideLoop = 340,
    /// `continue` outside a loop
    ContinueOutsideLoop = 341,
    /// Non-void function returns without a value
    ReturnValueMissing = 342,
    /// Void function (or constructor/destructor) returns a value
    ReturnValueForbidden = 343,
    // compiler: class layout
    /// Field initialized twice in one initializer list
    PropertyAlreadyInitialized = 350,
    /// Field type has no default constructor and no initializer
    NoDefaultConstructor = 351,
    /// Second destructor declared
    DestructorAlreadyExists = 352,
    /// Name collides with an existing declaration
    DuplicateIdentifier = 353,
    // compiler: values
    /// No conversion path between the two types
    NoConversion = 360,
    /// Type cannot be constructed with the given arguments
    NotConstructable = 361,
    /// Type or function used as a value
    TypeAsValue = 362,
    /// Call target is not callable
    NotCallable = 363,
    // compiler: internal
    /// Assert-style failure inside the compiler itself
    InternalError = 399,

    // backend
    /// Native backend cannot express a function signature
    NativeUnsupportedSignature = 401,
    /// Any other backend failure
    BackendFailure = 402,

    // runtime
    /// Exception escaped all catch handlers
    UncaughtException = 501,
    /// VM stack exhausted
    StackOverflow = 502,
    /// VM heap exhausted
    OutOfMemory = 503,
    /// Null object dereference
    NullAccess = 504,
    /// Integer division by zero
    DivisionByZero = 505,
}

/// A single diagnostic: code, severity, message, source range, and any
/// sub-diagnostics (e.g. overload candidates attached as notes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable code
    pub code: ErrorCode,
    /// Severity level
    pub severity: Severity,
    /// Rendered message
    pub message: String,
    /// Source range the diagnostic points at
    pub span: SourceSpan,
    /// Path of the module the diagnostic was raised in
    pub module_path: String,
    /// Attached notes
    pub notes: Vec<Diagnostic>,
}

impl Diagnostic {
    /// Creates an error-severity diagnostic.
    pub fn error(code: ErrorCode, message: impl Into<String>, span: SourceSpan) -> Self {
        Diagnostic {
            code,
            severity: Severity::Error,
            message: message.into(),
            span,
            module_path: String::new(),
            notes: Vec::new(),
        }
    }

    /// Creates an info-severity diagnostic.
    pub fn info(code: ErrorCode, message: impl Into<String>, span: SourceSpan) -> Self {
        Diagnostic {
            severity: Severity::Info,
            ..Diagnostic::error(code, message, span)
        }
    }

    /// Creates a warning-severity diagnostic.
    pub fn warn(code: ErrorCode, message: impl Into<String>, span: SourceSpan) -> Self {
        Diagnostic {
            severity: Severity::Warn,
            ..Diagnostic::error(code, message, span)
        }
    }

    /// Attaches a note and returns self.
    pub fn with_note(mut self, note: Diagnostic) -> Self {
        self.notes.push(note);
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: {}",
            self.module_path, self.span.line, self.span.col, self.severity, self.message
        )
    }
}

/// Transactional diagnostic sink.
///
/// The parser opens a logger transaction alongside each cursor transaction;
/// diagnostics submitted inside a reverted transaction are discarded, so
/// speculative grammar productions never leak errors.
#[derive(Debug, Default)]
pub struct Logger {
    committed: Vec<Diagnostic>,
    frames: Vec<Vec<Diagnostic>>,
}

impl Logger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Logger::default()
    }

    /// Opens a transaction frame.
    pub fn begin(&mut self) {
        self.frames.push(Vec::new());
    }

    /// Commits the innermost frame into its parent (or the committed set).
    pub fn commit(&mut self) {
        if let Some(frame) = self.frames.pop() {
            match self.frames.last_mut() {
                Some(parent) => parent.extend(frame),
                None => self.committed.extend(frame),
            }
        }
    }

    /// Discards the innermost frame and everything submitted within it.
    pub fn revert(&mut self) {
        self.frames.pop();
    }

    /// Submits a diagnostic into the innermost open frame.
    pub fn submit(&mut self, diag: Diagnostic) {
        tracing::debug!(code = ?diag.code, "{}", diag.message);
        match self.frames.last_mut() {
            Some(frame) => frame.push(diag),
            None => self.committed.push(diag),
        }
    }

    /// True if any committed or pending diagnostic is an error.
    pub fn has_errors(&self) -> bool {
        self.committed
            .iter()
            .chain(self.frames.iter().flatten())
            .any(|d| d.severity == Severity::Error)
    }

    /// Count of committed diagnostics (open frames excluded).
    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }

    /// All committed diagnostics.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.committed
    }

    /// Drains every diagnostic, committing open frames first.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        while !self.frames.is_empty() {
            self.commit();
        }
        std::mem::take(&mut self.committed)
    }
}

/// An error raised by generated code at run time, reverse-mapped to source.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    /// Stable code from the runtime group
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Source location mapped back through the instruction source map
    pub span: Option<SourceSpan>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.span {
            Some(s) => write!(f, "{} (at {}:{})", self.message, s.line, s.col),
            None => write!(f, "{}", self.message),
        }
    }
}

/// GScript toolchain errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Failed to read a source file or the module cache
    #[error("I/O error on {path}: {reason}")]
    Io {
        /// Path being accessed
        path: String,
        /// Stringified cause
        reason: String,
    },

    /// Compilation produced at least one error diagnostic
    #[error("compilation failed with {} error(s)", .diagnostics.iter().filter(|d| d.severity == Severity::Error).count())]
    Compile {
        /// Everything the logger accumulated, errors and otherwise
        diagnostics: Vec<Diagnostic>,
    },

    /// A cached module failed validation (corrupt, stale, or truncated)
    #[error("invalid module cache: {reason}")]
    Cache {
        /// Why validation failed
        reason: String,
    },

    /// Generated code failed at run time
    #[error("runtime error: {0}")]
    Runtime(RuntimeError),

    /// A backend could not translate a function
    #[error("backend error: {reason}")]
    Backend {
        /// Why the translation failed
        reason: String,
    },

    /// Host binding misuse (duplicate registration, unknown type, ...)
    #[error("binding error: {reason}")]
    Bind {
        /// What the host did wrong
        reason: String,
    },
}

impl Error {
    /// Wraps an I/O failure with its path.
    pub fn io(path: impl Into<String>, err: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// The diagnostics attached to a compile failure, if any.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Error::Compile { diagnostics } => diagnostics,
            _ => &[],
        }
    }
}

/// Result type for GScript operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_revert_discards() {
        let mut log = Logger::new();
        log.begin();
        log.submit(Diagnostic::error(
            ErrorCode::ExpectedIdentifier,
            "expected identifier",
            SourceSpan::default(),
        ));
        assert!(log.has_errors());
        log.revert();
        assert!(!log.has_errors());
        assert_eq!(log.committed_count(), 0);
    }

    #[test]
    fn test_logger_commit_nested() {
        let mut log = Logger::new();
        log.begin();
        log.begin();
        log.submit(Diagnostic::warn(
            ErrorCode::UnexpectedToken,
            "odd",
            SourceSpan::default(),
        ));
        log.commit();
        assert_eq!(log.committed_count(), 0);
        log.commit();
        assert_eq!(log.committed_count(), 1);
    }

    #[test]
    fn test_diagnostic_display() {
        let mut d = Diagnostic::error(
            ErrorCode::UndefinedIdentifier,
            "Identifier 'x' is undefined",
            SourceSpan::new(0, 1, 3, 7),
        );
        d.module_path = "main.gs".into();
        assert_eq!(
            d.to_string(),
            "main.gs:3:7: error: Identifier 'x' is undefined"
        );
    }

    #[test]
    fn test_diagnostic_serializes() {
        let d = Diagnostic::error(
            ErrorCode::NoConversion,
            "no conversion",
            SourceSpan::default(),
        );
        let json = serde_json::to_string(&d).unwrap();
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
