//! Operators that can be registered on a dispatcher.
pub mod aggregate;
pub mod bnl_join;
pub mod echo;
pub mod file_dump;
pub mod file_scan;
pub mod func_call;
pub mod hash_join;
pub mod sort;
pub mod table_scan;

use stagepipe_error::Result;

use crate::dispatcher::DispatcherBuilder;

/// Register every built-in stage with the builder's default stage config.
pub fn register_builtin_stages(builder: DispatcherBuilder) -> Result<DispatcherBuilder> {
    builder
        .register_stage::<table_scan::TableScan>()?
        .register_stage::<file_scan::FileScan>()?
        .register_stage::<file_dump::FileDump>()?
        .register_stage::<echo::Echo>()?
        .register_stage::<func_call::FuncCall>()?
        .register_stage::<aggregate::Aggregate>()?
        .register_stage::<sort::Sort>()?
        .register_stage::<hash_join::HashJoin>()?
        .register_stage::<bnl_join::BnlJoin>()
}
