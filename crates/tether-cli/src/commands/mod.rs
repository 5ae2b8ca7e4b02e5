pub mod audit;
pub mod exec;
pub mod tables;

pub use exec::ExecCommand;
pub use tables::TablesCommand;
