#![doc = include_str!("../README.md")]

mod adapt;
mod column;
mod connection;
mod connection_async;
mod copy;
mod cursor;
mod generators;
mod preparing;
mod queries;
mod rows;
mod server_cursor;
mod tpc;
mod transaction;
mod transform;
mod waiting;

pub mod conninfo;
pub mod dbapi;
pub mod errors;
pub mod pipeline;
pub mod pq;
pub mod sql;
pub mod types;

pub use self::{
    adapt::{AdaptersMap, DumpContext, Dumper, DumperKey, LoadContext, Loader, PyFormat, SessionInfo},
    column::Column,
    connection::{ConnectOptions, Connection, ConnectionInfo, IsolationLevel},
    connection_async::AsyncConnection,
    copy::Copy,
    cursor::{Cursor, ExecuteOptions, RowIter, RowStream, ScrollMode},
    errors::{Diagnostic, Error, ErrorClass},
    generators::{Ready, Wait},
    pipeline::Pipeline,
    pq::Notify,
    queries::{Params, Query},
    rows::{map_row, tuple_row, Row},
    server_cursor::{ServerCursor, ServerRowIter},
    tpc::Xid,
    transaction::Transaction,
    types::{EnumValue, Inet, Interval, RangeValue, Value, ValueKind},
};

use std::sync::{Arc, OnceLock};

static ADAPTERS: OnceLock<Arc<AdaptersMap>> = OnceLock::new();

/// the process wide adapters map, seeded with the builtin codecs.
///
/// every connection starts from a child of this map; registering adapters
/// on a connection shadows these defaults without mutating them.
pub fn global_adapters() -> &'static Arc<AdaptersMap> {
    ADAPTERS.get_or_init(|| Arc::new(types::default_adapters()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn global_adapters_are_seeded() {
        let adapters = global_adapters();
        assert!(adapters
            .get_dumper(types::ValueKind::Bool, PyFormat::Auto)
            .is_ok());
        assert!(adapters
            .get_loader(postgres_types::Type::INT4.oid(), pq::Format::Text)
            .is_some());
    }
}
