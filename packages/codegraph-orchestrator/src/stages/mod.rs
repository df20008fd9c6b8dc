// Built-in stage implementations
pub mod import_scan;

// Re-exports
pub use import_scan::{
    parse_imports, resolve_import, FileImports, ImportScanOutput, ImportScanStage, ImportStatement,
};
