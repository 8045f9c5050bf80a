//! waiting drivers consuming the protocol machines.
//!
//! Two universes share every machine in [`generators`]: a blocking one
//! sleeping in `poll(2)` and a cooperative one suspending on tokio readiness.
//! These functions are the only places the driver ever blocks.
//!
//! [`generators`]: crate::generators

use std::{io, os::fd::RawFd, time::Duration};

use tokio::io::{unix::AsyncFd, Interest};

use super::{
    errors::Error,
    generators::{Connect, ConnectStep, Machine, Ready, Step, Wait},
    pq::Pq,
};

/// drive a machine to completion against the blocking waiter.
pub(crate) fn wait<P, M>(pq: &mut P, machine: &mut M, timeout: Option<Duration>) -> Result<M::Output, Error>
where
    P: Pq,
    M: Machine<P>,
{
    let fd = pq.socket();
    // the first poll is opportunistic: machines re-check the handle state,
    // so acting on unconfirmed readiness is harmless.
    let mut ready = Ready::Rw;
    loop {
        match machine.poll(pq, ready)? {
            Step::Done(value) => return Ok(value),
            Step::Wait(w) => ready = poll_fd(fd, w, timeout)?,
        }
    }
}

/// drive the connection machine, re-reading the descriptor at every step.
pub(crate) fn wait_conn<P: Pq>(
    machine: &mut Connect<P>,
    timeout: Option<Duration>,
) -> Result<P, Error> {
    loop {
        match machine.poll()? {
            ConnectStep::Done(pq) => return Ok(pq),
            ConnectStep::Wait(fd, w) => {
                poll_fd(fd, w, timeout)?;
            }
        }
    }
}

/// drive a machine to completion on the current async runtime.
pub(crate) async fn wait_async<P, M>(pq: &mut P, machine: &mut M) -> Result<M::Output, Error>
where
    P: Pq,
    M: Machine<P>,
{
    let fd = pq.socket();
    let mut ready = Ready::Rw;
    loop {
        match machine.poll(pq, ready)? {
            Step::Done(value) => return Ok(value),
            Step::Wait(w) => ready = readiness_async(fd, w).await?,
        }
    }
}

/// async variant of [`wait_conn`]; *timeout* bounds every single step.
pub(crate) async fn wait_conn_async<P: Pq>(
    machine: &mut Connect<P>,
    timeout: Option<Duration>,
) -> Result<P, Error> {
    loop {
        match machine.poll()? {
            ConnectStep::Done(pq) => return Ok(pq),
            ConnectStep::Wait(fd, w) => {
                match timeout {
                    Some(t) => tokio::time::timeout(t, readiness_async(fd, w))
                        .await
                        .map_err(|_| Error::operational("timeout expired"))??,
                    None => readiness_async(fd, w).await?,
                };
            }
        }
    }
}

fn poll_fd(fd: RawFd, wait: Wait, timeout: Option<Duration>) -> Result<Ready, Error> {
    if fd < 0 {
        // handle without a real socket (e.g. the scripted test handle):
        // report instant readiness and let the machine settle on its own.
        return Ok(Ready::Rw);
    }

    let events = match wait {
        Wait::R => libc::POLLIN,
        Wait::W => libc::POLLOUT,
        Wait::Rw => libc::POLLIN | libc::POLLOUT,
    };
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = match timeout {
        Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
        None => -1,
    };

    loop {
        // SAFETY: pfd points to a single initialized pollfd for the whole call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::from(err));
        }
        if rc == 0 {
            return Err(Error::operational("timeout expired"));
        }

        let revents = pfd.revents;
        // error conditions are reported as readiness: the next handle call
        // surfaces the real failure with a proper message.
        let error = revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
        let readable = revents & libc::POLLIN != 0 || error;
        let writable = revents & libc::POLLOUT != 0 || error;
        return Ok(match (readable, writable) {
            (true, true) => Ready::Rw,
            (true, false) => Ready::R,
            _ => Ready::W,
        });
    }
}

struct BorrowedSocket(RawFd);

impl std::os::fd::AsRawFd for BorrowedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

async fn readiness_async(fd: RawFd, wait: Wait) -> Result<Ready, Error> {
    if fd < 0 {
        return Ok(Ready::Rw);
    }

    let interest = match wait {
        Wait::R => Interest::READABLE,
        Wait::W => Interest::WRITABLE,
        Wait::Rw => Interest::READABLE | Interest::WRITABLE,
    };
    let afd = AsyncFd::with_interest(BorrowedSocket(fd), interest)?;
    let mut guard = afd.ready(interest).await?;
    let readiness = guard.ready();
    guard.clear_ready();
    Ok(match (readiness.is_readable(), readiness.is_writable()) {
        (true, true) => Ready::Rw,
        (true, false) => Ready::R,
        _ => Ready::W,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generators::Execute;
    use crate::pq::mock::MockPq;
    use crate::pq::{ExecStatus, PqResult};

    #[test]
    fn blocking_wait_settles_against_mock() {
        let mut pq = MockPq::connected();
        pq.send_query(b"select 1").unwrap();
        let results = wait(&mut pq, &mut Execute::new(), None).unwrap();
        assert_eq!(results[0].status(), ExecStatus::TuplesOk);
    }

    #[tokio::test]
    async fn async_wait_settles_against_mock() {
        let mut pq = MockPq::connected();
        pq.send_query(b"select 1").unwrap();
        let results = wait_async(&mut pq, &mut Execute::new()).await.unwrap();
        assert_eq!(results[0].status(), ExecStatus::TuplesOk);
    }

    #[test]
    fn connect_machine_completes() {
        let mut machine = Connect::<MockPq>::start("host=localhost").unwrap();
        let pq = wait_conn(&mut machine, None).unwrap();
        assert_eq!(pq.backend_pid(), 42);
    }

    #[test]
    fn connect_failure_is_operational() {
        let mut machine = Connect::<MockPq>::start("host=bad mock_fail=1").unwrap();
        let err = wait_conn(&mut machine, None).unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Operational);
    }
}
