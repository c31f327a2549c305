pub mod consolidation;
pub mod oracle;
