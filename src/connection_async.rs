//! async connections: the cooperative twin of [`connection`].
//!
//! The protocol machines are exactly the ones the blocking connection
//! drives; only the waiting differs, suspending on runtime readiness
//! instead of sleeping in `poll(2)`. The surface is the subset that makes
//! sense without a blocking guard object: queries, transaction control and
//! notification waits.
//!
//! [`connection`]: crate::connection

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Mutex;

use super::{
    column::Column,
    connection::{ConnectOptions, Inner},
    conninfo::{conninfo_to_dict, make_conninfo},
    cursor::raise_from_results,
    errors::Error,
    generators::{Connect, Execute, Notifies},
    pq::{ConnStatus, ExecStatus, Format, Notify, Pq, PqCancel, PqResult, TransactionStatus},
    preparing::{Prepare, PrepareManager},
    queries::{Params, PostgresQuery, Query},
    rows::Row,
    transform::Transformer,
    waiting,
};

/// a single session with the backend, for cooperative schedulers.
pub struct AsyncConnection<P: Pq> {
    inner: Mutex<Inner<P>>,
    cancel: P::Cancel,
    explicitly_closed: AtomicBool,
}

impl<P: Pq> AsyncConnection<P> {
    /// connect to the database described by *conninfo*.
    pub async fn connect(conninfo: &str) -> Result<Self, Error> {
        Self::connect_with(conninfo, ConnectOptions::default()).await
    }

    pub async fn connect_with(conninfo: &str, options: ConnectOptions) -> Result<Self, Error> {
        let dict = conninfo_to_dict(
            conninfo,
            options.overrides.iter().map(|(k, v)| (k.as_str(), v.clone())),
        )?;
        let timeout = dict
            .get("connect_timeout")
            .map(|raw| {
                raw.parse::<f64>()
                    .map(|secs| std::time::Duration::from_secs(secs.max(0.0) as u64))
                    .map_err(|_| {
                        Error::programming(format!("bad value for connect_timeout: {raw:?}"))
                    })
            })
            .transpose()?
            .filter(|t| !t.is_zero());
        let conninfo = make_conninfo(&dict);

        let mut machine = Connect::<P>::start(&conninfo)?;
        let pq = waiting::wait_conn_async(&mut machine, timeout).await?;

        // the per connection state is shared with the blocking universe;
        // only the lock and the waiting differ
        let (inner, cancel) = super::connection::build_inner(pq, dict, options)?;
        Ok(Self {
            inner: Mutex::new(inner),
            cancel,
            explicitly_closed: AtomicBool::new(false),
        })
    }

    pub async fn closed(&self) -> bool {
        self.inner.lock().await.pq.status() == ConnStatus::Bad
    }

    pub async fn close(&self) {
        self.explicitly_closed.store(true, Ordering::SeqCst);
        self.inner.lock().await.pq.finish();
    }

    /// request cancellation of the running command, out of band.
    pub fn cancel(&self) -> Result<(), Error> {
        if self.explicitly_closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel()
    }

    pub async fn autocommit(&self) -> bool {
        self.inner.lock().await.autocommit
    }

    pub async fn set_autocommit(&self, value: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let status = inner.pq.transaction_status();
        if status != TransactionStatus::Idle {
            return Err(Error::programming(format!(
                "can't change 'autocommit' now: connection in transaction status {}",
                status.name()
            )));
        }
        inner.autocommit = value;
        Ok(())
    }

    /// execute one query and return all its rows.
    pub async fn execute(
        &self,
        query: impl Into<Query>,
        params: Option<Params>,
    ) -> Result<Vec<Row>, Error> {
        let query = query.into();
        let mut inner = self.inner.lock().await;
        inner.check_connection_ok()?;
        self.start_query(&mut inner).await?;

        let mut transformer = Transformer::new(
            Arc::clone(&inner.adapters),
            inner.session_info(),
        );
        let pgq = PostgresQuery::convert(&query, params.as_ref(), &mut transformer)?;

        let (prep, name) = inner.prepared.get(&pgq, None);
        let key = PrepareManager::key(&pgq);

        if prep == Prepare::Should {
            inner.pq.send_prepare(&name, &pgq.query, &pgq.types())?;
            let results = waiting::wait_async(&mut inner.pq, &mut Execute::new()).await?;
            if let Some(res) = results.first() {
                if res.status() == ExecStatus::FatalError {
                    return Err(Error::from_result(res));
                }
            }
        }

        match (&pgq.params, prep) {
            (_, Prepare::Yes | Prepare::Should) => {
                let empty = crate::transform::DumpedParams::default();
                let dumped = pgq.params.as_ref().unwrap_or(&empty);
                inner
                    .pq
                    .send_query_prepared(&name, &dumped.params, &dumped.formats, Format::Text)?;
            }
            (Some(dumped), Prepare::No) => {
                inner.pq.send_query_params(
                    &pgq.query,
                    &dumped.params,
                    &dumped.types,
                    &dumped.formats,
                    Format::Text,
                )?;
            }
            (None, Prepare::No) => inner.pq.send_query(&pgq.query)?,
        }

        let results = waiting::wait_async(&mut inner.pq, &mut Execute::new()).await?;
        for res in &results {
            if !matches!(
                res.status(),
                ExecStatus::TuplesOk | ExecStatus::CommandOk | ExecStatus::EmptyQuery
            ) {
                raise_from_results(&results)?;
            }
        }

        let cmd = inner.prepared.maintain(key, &results, prep, &name);
        if let Some(cmd) = cmd {
            self.exec_command(&mut inner, cmd).await?;
        }

        let result = &results[0];
        transformer.set_result(Some(result), true, None)?;
        let columns: Arc<[Column]> = (0..result.nfields())
            .map(|i| Column::from_result(result, i))
            .collect::<Vec<_>>()
            .into();
        let rows = transformer
            .load_rows(result, 0, result.ntuples())?
            .into_iter()
            .map(|values| Row::new(values, Arc::clone(&columns)))
            .collect();
        Ok(rows)
    }

    pub async fn commit(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.tpc.is_some() {
            return Err(Error::programming(
                "commit() cannot be used during a two-phase transaction",
            ));
        }
        if inner.pq.transaction_status() == TransactionStatus::Idle {
            return Ok(());
        }
        self.exec_command(&mut inner, b"COMMIT".to_vec()).await
    }

    pub async fn rollback(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.tpc.is_some() {
            return Err(Error::programming(
                "rollback() cannot be used during a two-phase transaction",
            ));
        }
        if inner.pq.transaction_status() == TransactionStatus::Idle {
            return Ok(());
        }
        self.exec_command(&mut inner, b"ROLLBACK".to_vec()).await?;
        if let Some(cmd) = inner.prepared.clear() {
            self.exec_command(&mut inner, cmd).await?;
        }
        Ok(())
    }

    /// wait for, then return the asynchronous notifications received.
    pub async fn notifies(&self) -> Result<Vec<Notify>, Error> {
        let mut inner = self.inner.lock().await;
        waiting::wait_async(&mut inner.pq, &mut Notifies::new()).await
    }

    async fn start_query(&self, inner: &mut Inner<P>) -> Result<(), Error> {
        if inner.autocommit || inner.pq.transaction_status() != TransactionStatus::Idle {
            return Ok(());
        }
        let begin = inner.tx_start_command();
        self.exec_command(inner, begin).await
    }

    async fn exec_command(&self, inner: &mut Inner<P>, command: Vec<u8>) -> Result<(), Error> {
        inner.pq.send_query(&command)?;
        let results = waiting::wait_async(&mut inner.pq, &mut Execute::new()).await?;
        match results.last().map(|r| r.status()) {
            Some(ExecStatus::CommandOk | ExecStatus::TuplesOk) => Ok(()),
            Some(ExecStatus::FatalError) => Err(Error::from_result(results.last().unwrap())),
            other => Err(Error::interface(format!(
                "unexpected result {other:?} from command"
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pq::mock::{MockColumn, MockPq, MockResult};
    use crate::types::Value;
    use postgres_types::Type;

    #[tokio::test]
    async fn async_connect_execute_commit() {
        let conn = AsyncConnection::<MockPq>::connect("dbname=test").await.unwrap();
        {
            let mut inner = conn.inner.lock().await;
            inner.pq.expect(vec![MockResult::tuples(
                vec![MockColumn::new("n", &Type::INT4)],
                vec![vec![Some(b"7".to_vec())]],
            )]);
        }

        let rows = conn
            .execute("select %s", Some(Params::positional([7i32])))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0).unwrap(), &Value::Int(7));

        // the implicit BEGIN went out: commit returns the session to idle
        conn.commit().await.unwrap();
        let inner = conn.inner.lock().await;
        assert_eq!(
            inner.pq.transaction_status_now(),
            TransactionStatus::Idle
        );
    }

    #[tokio::test]
    async fn async_rollback_clears_prepared_cache() {
        let conn = AsyncConnection::<MockPq>::connect("dbname=test").await.unwrap();
        {
            let mut inner = conn.inner.lock().await;
            inner.prepared.prepare_threshold = Some(0);
            inner.pq.expect(vec![MockResult::tuples(Vec::new(), Vec::new())]);
        }
        conn.execute("select %s", Some(Params::positional([1i32])))
            .await
            .unwrap();
        conn.rollback().await.unwrap();

        let mut inner = conn.inner.lock().await;
        let sent = inner.pq.take_sent();
        let all = format!("{sent:?}");
        assert!(all.contains("DEALLOCATE ALL"), "{all}");
    }

    #[tokio::test]
    async fn async_close_is_idempotent() {
        let conn = AsyncConnection::<MockPq>::connect("dbname=test").await.unwrap();
        conn.close().await;
        assert!(conn.closed().await);
        conn.close().await;
        conn.cancel().unwrap();
    }
}
