// Curator's Utilities Module
//
// Common utilities and helper functions used throughout the Curator codebase.

/// SQL identifier validation, quoting, and statement rewriting
pub mod sql;

/// Connection string redaction for safe logging
pub mod redact;
