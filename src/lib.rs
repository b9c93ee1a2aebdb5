//! # maeshori
//! C/C++ preprocessor engine.
//!
//! The engine consumes a translation unit's source bytes and produces a
//! preprocessed byte stream plus a synchronous event log: every macro
//! definition, reference and expansion, every skipped conditional region,
//! every include request and include-guard discovery is reported to a
//! host-provided [`Client`].
//!
//! `#include` resolution is the host's job: the engine only emits
//! [`Client::source_needed`], and the host answers by merging macros from
//! its [`Snapshot`] of already-processed documents. The
//! [`FastPreprocessor`] builds on that snapshot to re-preprocess a file
//! without walking its include graph again.
//!
//! ```
//! use maeshori::{Environment, Preprocessor};
//!
//! let mut env = Environment::new();
//! let mut pp = Preprocessor::new(None, &mut env);
//! let out = pp.run_opts("demo.c", b"#define GREETING hello\nGREETING\n", true, false);
//! assert_eq!(String::from_utf8_lossy(&out).split_whitespace().next(), Some("hello"));
//! ```

mod buffer;
mod client;
mod engine;
mod environment;
mod error;
mod expr;
mod fast;
mod guard;
mod lexer;
mod macros;
mod snapshot;
mod token;
mod util;

pub use client::{is_injected_file, Client, IncludeType, MacroArgumentReference};
pub use engine::{Limits, Preprocessor, CONFIGURATION_FILE_NAME};
pub use environment::Environment;
pub use error::{Diagnostic, DiagnosticKind, EnvironmentError};
pub use expr::{ExpressionEvaluator, Value};
pub use fast::FastPreprocessor;
pub use guard::{IncludeGuardHint, IncludeGuardState, IncludeGuardTracker};
pub use lexer::{tokenize, Lexer};
pub use macros::Macro;
pub use snapshot::{Document, Include, MacroUse, Snapshot, UndefinedMacroUse};
pub use token::{Kind, PPToken, SourceBytes};
