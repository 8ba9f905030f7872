// coderoom-common: wire protocol and shared domain types for the Coderoom workspace

pub mod protocol;
pub mod types;
