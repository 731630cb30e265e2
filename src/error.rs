// ABOUTME: Error taxonomy for the stack engine (parse/resolution/type/budget/capability)

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// A source location used for the `±30`-character error-position framing
/// around a parse/resolution failure.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    /// A `±30`-character excerpt of the source line around the offending
    /// token, delimited by `=>`/`<=` markers. `None` when the position was
    /// reconstructed without the original source text to draw from (an
    /// API-driven forced macro close, for instance).
    pub window: Option<String>,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Position {
            line,
            column,
            window: None,
        }
    }

    pub fn with_window(line: usize, column: usize, window: String) -> Self {
        Position {
            line,
            column,
            window: Some(window),
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)?;
        if let Some(window) = &self.window {
            write!(f, ", near {window}")?;
        }
        Ok(())
    }
}

/// Builds the `±30`-character excerpt around `column` (a character index
/// into `source`), wrapping the `token_len`-character token at that column
/// in `=>`/`<=` markers. Operates on `char`s rather than bytes so a
/// multi-byte UTF-8 source line never gets sliced mid-codepoint.
pub(crate) fn windowed_excerpt(source: &str, column: usize, token_len: usize) -> String {
    let chars: Vec<char> = source.chars().collect();
    let column = column.min(chars.len());
    let token_end = (column + token_len).min(chars.len());
    let start = column.saturating_sub(30);
    let end = (token_end + 30).min(chars.len());
    let before: String = chars[start..column].iter().collect();
    let token: String = chars[column..token_end].iter().collect();
    let after: String = chars[token_end..end].iter().collect();
    format!("{before}=>{token}<={after}")
}

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    // ===== Parse errors =====
    #[error("unbalanced {construct} block")]
    UnbalancedBlock {
        construct: &'static str,
        position: Option<Position>,
    },

    #[error("unterminated string")]
    UnterminatedString { position: Option<Position> },

    #[error("invalid percent-escape in string")]
    InvalidEscape { position: Option<Position> },

    #[error("forbidden construct: {construct}")]
    ForbiddenConstruct {
        construct: String,
        position: Option<Position>,
    },

    // ===== Resolution errors =====
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unknown macro: {0}")]
    UnknownMacro(String),

    #[error("{0} is undefined")]
    UndefinedRedefinition(String),

    #[error("function redefinition is not allowed: {0}")]
    RedefinitionDisallowed(String),

    // ===== Type errors =====
    #[error("{operator}: operands must be of the same type, got {left} and {right}")]
    HeterogeneousTypes {
        operator: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("{function}: unsupported operand type {actual}")]
    UnsupportedOperand {
        function: &'static str,
        actual: &'static str,
    },

    // ===== Budget errors =====
    #[error("operation count exceeded: {current} > {max}")]
    OpCountExceeded { current: u64, max: u64 },

    #[error("recursion level exceeded: {current} > {max}")]
    RecursionExceeded { current: u32, max: u32 },

    #[error("stack depth exceeded: {attempted} > {max}")]
    StackDepthExceeded { attempted: usize, max: usize },

    #[error("symbol table full: {max} symbols")]
    SymbolTableFull { max: usize },

    #[error("register index out of range: {index} (size {size})")]
    RegisterOutOfRange { index: usize, size: usize },

    // ===== Capability errors =====
    #[error("capability not present: {0}")]
    CapabilityMissing(String),

    // ===== Generic =====
    #[error("{message}")]
    Generic { message: String },

    /// An error re-raised by `exec` with macro/section/statement framing.
    /// Never constructed for a secure frame.
    #[error("{message} (at statement {statement_index})")]
    Framed {
        message: String,
        statement_index: usize,
        section: Option<String>,
        macro_name: Option<String>,
        position: Option<Position>,
    },
}

impl EngineError {
    pub fn generic(message: impl Into<String>) -> Self {
        EngineError::Generic {
            message: message.into(),
        }
    }

    /// Renders the full diagnostic including section/macro/position (and,
    /// when the position carries one, its windowed source excerpt), the
    /// way a CLI host would print it. `Display` on its own only carries the
    /// bare message plus statement index, matching how `exec` builds it
    /// incrementally.
    pub fn diagnostic(&self) -> String {
        let EngineError::Framed {
            message,
            statement_index,
            section,
            macro_name,
            position,
        } = self
        else {
            return self.to_string();
        };
        let mut out = format!("{message} (at statement {statement_index}");
        if let Some(section) = section {
            out.push_str(&format!(", section {section}"));
        }
        if let Some(macro_name) = macro_name {
            out.push_str(&format!(", macro {macro_name}"));
        }
        if let Some(position) = position {
            out.push_str(&format!(", {position}"));
        }
        out.push(')');
        out
    }

    /// Wrap `self` with statement/section/macro framing, unless it already
    /// is a `Framed` error (framing is applied once, at the outermost
    /// non-secure `exec` frame that sees it).
    pub fn framed(
        self,
        statement_index: usize,
        section: Option<String>,
        macro_name: Option<String>,
        position: Option<Position>,
    ) -> Self {
        match self {
            EngineError::Framed { .. } => self,
            other => EngineError::Framed {
                message: other.to_string(),
                statement_index,
                section,
                macro_name,
                position,
            },
        }
    }
}

/// Control-flow "errors" are not reported errors at all: they unwind the
/// executor's inner loop. Kept out of `EngineError` so the framing logic
/// can never accidentally wrap one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Carries the number of enclosing macro frames left to unwind;
    /// `exec` decrements it on each frame it passes through and swallows
    /// the exception once it reaches zero.
    Return(u32),
    /// Cooperative, clean termination of the whole execution.
    Stop,
    /// Cooperative termination; the signal sticks so enclosing frames also
    /// abort.
    Kill,
}

impl std::fmt::Display for ControlFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlFlow::Return(n) => write!(f, "return({n})"),
            ControlFlow::Stop => write!(f, "stop"),
            ControlFlow::Kill => write!(f, "kill"),
        }
    }
}

/// Outcome of running a macro entry or a whole macro: either a reported
/// error, or control flow unwinding through the executor.
#[derive(Debug, Clone)]
pub enum ExecError {
    Engine(EngineError),
    Control(ControlFlow),
}

impl From<EngineError> for ExecError {
    fn from(e: EngineError) -> Self {
        ExecError::Engine(e)
    }
}

impl From<ControlFlow> for ExecError {
    fn from(c: ControlFlow) -> Self {
        ExecError::Control(c)
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
