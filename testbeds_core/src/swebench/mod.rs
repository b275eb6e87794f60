//! SWE-bench specifics: command construction, log parsing and grading.

pub mod constants;
pub mod grading;
pub mod log_parsers;
pub mod test_spec;

pub use grading::{GradeReport, grade};
pub use log_parsers::{ParserRegistry, TestOutputParser};
pub use test_spec::TestSpec;
