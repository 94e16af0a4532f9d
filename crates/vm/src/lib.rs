// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

//! The VM adapter: the subset of the SQL virtual machine's opcodes that
//! touches the ordered KV layer, together with the connection-level
//! savepoint stack and schema-cookie handling.

mod affinity;
mod database;
mod exec;
mod program;
mod vmcursor;

pub use affinity::{Affinity, apply_affinity};
pub use database::{BackendKind, Database, Savepoint};
pub use exec::Vm;
pub use program::{Op, ProbeSrc, SavepointOp};
