//! Host callable metadata and registration types.
//!
//! Describes native functions the host exposes to scripts: their
//! signatures and documentation. The metadata powers argument diagnostics
//! and lets an embedder generate a scripting-side reference for its users
//! via [`describe_host_fns`].

use std::fmt;

use crate::value::{CastError, ErrorValue, Value};

/// Error raised while binding script arguments to a host function.
#[derive(Debug, Clone)]
pub enum HostCallError {
    /// A required argument was not provided.
    MissingArgument { name: String },
    /// An argument had the wrong type.
    BadArgument { arg: String, error: CastError },
    /// The host function failed.
    ExecutionError { message: String },
}

impl HostCallError {
    pub fn missing_argument(name: impl Into<String>) -> Self {
        Self::MissingArgument { name: name.into() }
    }

    pub fn bad_argument(arg: impl Into<String>, error: CastError) -> Self {
        Self::BadArgument { arg: arg.into(), error }
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::ExecutionError { message: message.into() }
    }
}

impl fmt::Display for HostCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArgument { name } => {
                write!(f, "missing required argument: {}", name)
            }
            Self::BadArgument { arg, error } => {
                write!(f, "argument '{}': {}", arg, error)
            }
            Self::ExecutionError { message } => {
                write!(f, "execution error: {}", message)
            }
        }
    }
}

impl std::error::Error for HostCallError {}

impl From<HostCallError> for ErrorValue {
    fn from(err: HostCallError) -> Self {
        match &err {
            HostCallError::MissingArgument { .. } => {
                ErrorValue::wrong_num_arguments(err.to_string())
            }
            HostCallError::BadArgument { .. } => ErrorValue::type_error(err.to_string()),
            HostCallError::ExecutionError { .. } => ErrorValue::new("error", err.to_string()),
        }
    }
}

/// Trait for host functions that can be registered with an
/// [`Engine`](crate::Engine).
///
/// Implemented by the `#[host_fn]` macro; `engine.add(my_fn)` registers
/// the generated type.
pub trait HostFn {
    /// The function's metadata.
    fn info() -> &'static HostFnInfo;

    /// Call the function with already-popped positional arguments.
    fn call(args: Vec<Value>) -> Result<Value, ErrorValue>;
}

/// Information about one argument of a host function.
#[derive(Debug, Clone)]
pub struct ArgInfo {
    pub name: String,
    /// The script-side type name, e.g. `int`, `string`, `array`.
    pub type_name: String,
    pub description: String,
    pub required: bool,
}

impl ArgInfo {
    pub fn required(
        name: impl Into<String>,
        type_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        type_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// Metadata about a host function callable from scripts.
///
/// # Example
///
/// ```
/// use quill::HostFnInfo;
///
/// let info = HostFnInfo::new("fetch_weather", "Get current weather for a city")
///     .arg("city", "string", "The city name")
///     .arg_opt("unit", "string", "Temperature unit")
///     .returns("dict");
///
/// assert_eq!(
///     info.signature(),
///     "fetch_weather(city: string, unit?: string) -> dict"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct HostFnInfo {
    pub name: String,
    pub description: String,
    pub args: Vec<ArgInfo>,
    pub returns: String,
}

impl HostFnInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: Vec::new(),
            returns: "nil".to_string(),
        }
    }

    /// Add a required argument.
    pub fn arg(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.args.push(ArgInfo::required(name, type_name, description));
        self
    }

    /// Add an optional argument.
    pub fn arg_opt(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.args.push(ArgInfo::optional(name, type_name, description));
        self
    }

    /// Set the return type.
    pub fn returns(mut self, type_name: impl Into<String>) -> Self {
        self.returns = type_name.into();
        self
    }

    /// The script-level signature, e.g. `add(a: int, b: int) -> int`.
    pub fn signature(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.required {
                    format!("{}: {}", arg.name, arg.type_name)
                } else {
                    format!("{}?: {}", arg.name, arg.type_name)
                }
            })
            .collect();
        format!("{}({}) -> {}", self.name, args.join(", "), self.returns)
    }

    /// A documentation block for embedding in host-side references.
    pub fn doc(&self) -> String {
        let mut doc = format!("func {}\n", self.signature());
        doc.push_str(&format!("    {}\n", self.description));
        if !self.args.is_empty() {
            doc.push_str("    Args:\n");
            for arg in &self.args {
                doc.push_str(&format!("        {}: {}\n", arg.name, arg.description));
            }
        }
        doc
    }
}

impl fmt::Display for HostFnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.doc())
    }
}

/// Generate documentation for several host functions at once.
pub fn describe_host_fns(infos: &[HostFnInfo]) -> String {
    infos.iter().map(HostFnInfo::doc).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_no_args() {
        let info = HostFnInfo::new("now", "Current time").returns("string");
        assert_eq!(info.signature(), "now() -> string");
    }

    #[test]
    fn test_signature_mixed_args() {
        let info = HostFnInfo::new("search", "Search items")
            .arg("query", "string", "Search query")
            .arg_opt("limit", "int", "Max results")
            .returns("array");
        assert_eq!(info.signature(), "search(query: string, limit?: int) -> array");
    }

    #[test]
    fn test_doc_contains_description_and_args() {
        let info = HostFnInfo::new("add", "Add two numbers")
            .arg("a", "int", "First")
            .arg("b", "int", "Second")
            .returns("int");
        let doc = info.doc();
        assert!(doc.contains("func add(a: int, b: int) -> int"));
        assert!(doc.contains("Add two numbers"));
        assert!(doc.contains("a: First"));
    }

    #[test]
    fn test_describe_host_fns() {
        let docs = describe_host_fns(&[
            HostFnInfo::new("a", "Does A").returns("int"),
            HostFnInfo::new("b", "Does B").returns("string"),
        ]);
        assert!(docs.contains("func a() -> int"));
        assert!(docs.contains("func b() -> string"));
    }
}
