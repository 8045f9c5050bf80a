//! transaction blocks with savepoint nesting.

use super::{
    connection::{Connection, Inner},
    errors::Error,
    pq::{Pq, TransactionStatus},
    sql::{identifier, sql},
};

enum State {
    WantRollback,
    Finished,
}

/// a transaction block guard.
///
/// the first block on an idle session opens a real transaction; blocks
/// opened inside it stack savepoints. Dropping the guard rolls back, like
/// leaving the original context manager on an exception; committing must be
/// explicit. A guard rolled back or committed leaves the outer levels
/// untouched.
pub struct Transaction<'c, P: Pq> {
    conn: &'c Connection<P>,
    savepoint_name: String,
    outer: bool,
    force_rollback: bool,
    state: State,
}

impl<'c, P: Pq> Transaction<'c, P> {
    pub(crate) fn begin(
        conn: &'c Connection<P>,
        savepoint_name: Option<&str>,
        force_rollback: bool,
    ) -> Result<Self, Error> {
        let mut inner = conn.lock();
        inner.check_connection_ok()?;

        let outer = inner.pq.transaction_status() == TransactionStatus::Idle;
        let savepoint_name = match (outer, savepoint_name) {
            (_, Some(name)) => name.to_string(),
            (true, None) => String::new(),
            // inner blocks always need a savepoint to roll back to
            (false, None) => format!("_pg3_{}", inner.savepoints.len() + 1),
        };

        let mut commands: Vec<Vec<u8>> = Vec::new();
        if outer {
            commands.push(inner.tx_start_command());
        }
        if !savepoint_name.is_empty() {
            commands.push(savepoint_command(&inner, "SAVEPOINT {}", &savepoint_name)?);
        }

        inner.savepoints.push(savepoint_name.clone());
        let command = commands.join(&b"; "[..]);
        if let Err(e) = inner.exec_command(command) {
            inner.savepoints.pop();
            return Err(e);
        }
        if inner.pipeline.is_some() {
            crate::pipeline::sync_pipeline(&mut inner)?;
        }

        Ok(Self {
            conn,
            savepoint_name,
            outer,
            force_rollback,
            state: State::WantRollback,
        })
    }

    /// the savepoint the block is protected by; `None` for the main
    /// transaction.
    pub fn savepoint_name(&self) -> Option<&str> {
        (!self.savepoint_name.is_empty()).then_some(self.savepoint_name.as_str())
    }

    pub fn connection(&self) -> &'c Connection<P> {
        self.conn
    }

    /// open a nested block protected by a savepoint.
    pub fn transaction(&mut self) -> Result<Transaction<'c, P>, Error> {
        Transaction::begin(self.conn, None, false)
    }

    /// close the block keeping its changes. a block opened with
    /// `force_rollback` discards them instead.
    pub fn commit(mut self) -> Result<(), Error> {
        if self.force_rollback {
            return self.do_rollback();
        }
        self.state = State::Finished;
        let mut inner = self.conn.lock();
        self.pop_savepoint(&mut inner)?;

        let mut commands: Vec<Vec<u8>> = Vec::new();
        if !self.savepoint_name.is_empty() && !self.outer {
            commands.push(savepoint_command(&inner, "RELEASE {}", &self.savepoint_name)?);
        }
        if self.outer {
            commands.push(b"COMMIT".to_vec());
        }
        if !commands.is_empty() {
            inner.exec_command(commands.join(&b"; "[..]))?;
        }
        Ok(())
    }

    /// close the block discarding its changes.
    pub fn rollback(mut self) -> Result<(), Error> {
        self.do_rollback()
    }

    fn do_rollback(&mut self) -> Result<(), Error> {
        self.state = State::Finished;
        let mut inner = self.conn.lock();
        self.pop_savepoint(&mut inner)?;

        let mut commands: Vec<Vec<u8>> = Vec::new();
        if !self.savepoint_name.is_empty() && !self.outer {
            commands.push(savepoint_command(
                &inner,
                "ROLLBACK TO {n}; RELEASE {n}",
                &self.savepoint_name,
            )?);
        }
        if self.outer {
            commands.push(b"ROLLBACK".to_vec());
        }

        // statements prepared within the rolled back transaction are gone
        // on the server as well
        if let Some(cmd) = inner.prepared.clear() {
            commands.push(cmd);
        }
        if !commands.is_empty() {
            inner.exec_command(commands.join(&b"; "[..]))?;
        }
        Ok(())
    }

    fn pop_savepoint(&self, inner: &mut Inner<P>) -> Result<(), Error> {
        match inner.savepoints.pop() {
            Some(name) if name == self.savepoint_name => Ok(()),
            Some(name) => {
                inner.savepoints.push(name);
                Err(Error::programming(
                    "transaction blocks closed out of order",
                ))
            }
            None => Err(Error::programming(
                "transaction block closed but none is open",
            )),
        }
    }
}

impl<P: Pq> Drop for Transaction<'_, P> {
    fn drop(&mut self) {
        if let State::WantRollback = self.state {
            if let Err(e) = self.do_rollback() {
                tracing::warn!(error = %e, "error ignored rolling back transaction");
            }
        }
    }
}

fn savepoint_command<P: Pq>(
    inner: &Inner<P>,
    template: &str,
    name: &str,
) -> Result<Vec<u8>, Error> {
    let session = inner.session_info();
    sql(template)
        .format(vec![identifier([name])], &[("n", identifier([name]))])?
        .as_bytes(&inner.adapters, &session)
}
