//! protocol state machines driving a wire handle.
//!
//! Connecting, querying and COPY are an interleave of handle calls and
//! waiting for the socket. Every machine in this module exposes
//! `poll(&mut handle, ready)` returning either [`Step::Wait`] with the
//! readiness it needs or [`Step::Done`] with its final value. The functions
//! in [`waiting`] are the ones that actually sleep, in blocking or
//! cooperative fashion, and feed readiness back in.
//!
//! Machines are level triggered: acting on spurious readiness only leads to
//! another `would block` report from the handle, so the first poll may be
//! issued with both flags set.
//!
//! [`waiting`]: crate::waiting

use core::mem;

use std::{collections::VecDeque, os::fd::RawFd};

use bytes::Bytes;

use super::{
    errors::Error,
    pq::{ConnStatus, CopyData, ExecStatus, FlushStatus, Pq, PollingStatus, PqResult, PutStatus},
};

/// readiness a machine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    R,
    W,
    Rw,
}

/// readiness reported back by a waiting driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    R,
    W,
    Rw,
}

impl Ready {
    pub(crate) fn readable(self) -> bool {
        matches!(self, Self::R | Self::Rw)
    }

    pub(crate) fn writable(self) -> bool {
        matches!(self, Self::W | Self::Rw)
    }
}

/// outcome of polling a machine once.
pub(crate) enum Step<T> {
    Wait(Wait),
    Done(T),
}

pub(crate) trait Machine<P: Pq> {
    type Output;

    fn poll(&mut self, pq: &mut P, ready: Ready) -> Result<Step<Self::Output>, Error>;
}

/// connection establishment. owns the handle until it reports OK.
///
/// this one is driven separately from the other machines because the file
/// descriptor may change between polls while the handle walks its host list.
pub(crate) struct Connect<P: Pq> {
    pq: Option<P>,
}

pub(crate) enum ConnectStep<P> {
    Wait(RawFd, Wait),
    Done(P),
}

impl<P: Pq> Connect<P> {
    pub(crate) fn start(conninfo: &str) -> Result<Self, Error> {
        Ok(Self {
            pq: Some(P::connect_start(conninfo)?),
        })
    }

    pub(crate) fn poll(&mut self) -> Result<ConnectStep<P>, Error> {
        let pq = self
            .pq
            .as_mut()
            .ok_or_else(|| Error::internal("connection machine polled after completion"))?;

        if pq.status() == ConnStatus::Bad {
            return Err(Error::operational(format!(
                "connection is bad: {}",
                pq.error_message()
            )));
        }

        match pq.connect_poll() {
            PollingStatus::Ok => {
                let mut pq = self.pq.take().unwrap();
                pq.set_nonblocking(true)?;
                Ok(ConnectStep::Done(pq))
            }
            PollingStatus::Reading => Ok(ConnectStep::Wait(pq.socket(), Wait::R)),
            PollingStatus::Writing => Ok(ConnectStep::Wait(pq.socket(), Wait::W)),
            PollingStatus::Failed => Err(Error::operational(format!(
                "connection failed: {}",
                pq.error_message()
            ))),
        }
    }
}

/// flush the outbound buffer of an already queued command.
pub(crate) struct Send;

impl<P: Pq> Machine<P> for Send {
    type Output = ();

    fn poll(&mut self, pq: &mut P, ready: Ready) -> Result<Step<()>, Error> {
        if ready.readable() {
            // this may read notifies: they stay buffered in the handle and
            // are delivered once the driving call completes.
            pq.consume_input()?;
        }
        match pq.flush()? {
            FlushStatus::Done => Ok(Step::Done(())),
            FlushStatus::WouldBlock => Ok(Step::Wait(Wait::Rw)),
        }
    }
}

/// retrieve a single result, or `None` when the command is exhausted.
pub(crate) struct Fetch;

impl<P: Pq> Machine<P> for Fetch {
    type Output = Option<P::Result>;

    fn poll(&mut self, pq: &mut P, _ready: Ready) -> Result<Step<Self::Output>, Error> {
        if pq.is_busy() {
            pq.consume_input()?;
            if pq.is_busy() {
                return Ok(Step::Wait(Wait::R));
            }
        }
        Ok(Step::Done(pq.get_result()))
    }
}

/// retrieve every result of the current command.
pub(crate) struct FetchMany<P: Pq> {
    results: Vec<P::Result>,
}

impl<P: Pq> FetchMany<P> {
    pub(crate) fn new() -> Self {
        Self { results: Vec::new() }
    }
}

impl<P: Pq> Machine<P> for FetchMany<P> {
    type Output = Vec<P::Result>;

    fn poll(&mut self, pq: &mut P, ready: Ready) -> Result<Step<Self::Output>, Error> {
        loop {
            match Fetch.poll(pq, ready)? {
                Step::Wait(w) => return Ok(Step::Wait(w)),
                Step::Done(None) => return Ok(Step::Done(mem::take(&mut self.results))),
                Step::Done(Some(res)) => {
                    let copy = res.status().is_copy();
                    self.results.push(res);
                    if copy {
                        // after entering copy mode the handle manufactures a
                        // phony result for every request: stop the loop here.
                        return Ok(Step::Done(mem::take(&mut self.results)));
                    }
                }
            }
        }
    }
}

/// send a queued command and collect all its results.
pub(crate) struct Execute<P: Pq> {
    sending: bool,
    fetch: FetchMany<P>,
}

impl<P: Pq> Execute<P> {
    pub(crate) fn new() -> Self {
        Self {
            sending: true,
            fetch: FetchMany::new(),
        }
    }
}

impl<P: Pq> Machine<P> for Execute<P> {
    type Output = Vec<P::Result>;

    fn poll(&mut self, pq: &mut P, ready: Ready) -> Result<Step<Self::Output>, Error> {
        if self.sending {
            match Send.poll(pq, ready)? {
                Step::Wait(w) => return Ok(Step::Wait(w)),
                Step::Done(()) => self.sending = false,
            }
        }
        self.fetch.poll(pq, ready)
    }
}

/// one step of COPY OUT: either a chunk of data or the terminating result.
pub(crate) enum CopyChunk<P: Pq> {
    Data(Bytes),
    Done(P::Result),
}

pub(crate) struct CopyFrom<P: Pq> {
    finishing: Option<FetchMany<P>>,
}

impl<P: Pq> CopyFrom<P> {
    pub(crate) fn new() -> Self {
        Self { finishing: None }
    }
}

impl<P: Pq> Machine<P> for CopyFrom<P> {
    type Output = CopyChunk<P>;

    fn poll(&mut self, pq: &mut P, ready: Ready) -> Result<Step<Self::Output>, Error> {
        if self.finishing.is_none() {
            loop {
                match pq.get_copy_data(true)? {
                    CopyData::Chunk(data) => return Ok(Step::Done(CopyChunk::Data(data))),
                    CopyData::WouldBlock => {
                        pq.consume_input()?;
                        match pq.get_copy_data(true)? {
                            CopyData::Chunk(data) => {
                                return Ok(Step::Done(CopyChunk::Data(data)))
                            }
                            CopyData::WouldBlock => return Ok(Step::Wait(Wait::R)),
                            CopyData::Done => break,
                        }
                    }
                    CopyData::Done => break,
                }
            }
            self.finishing = Some(FetchMany::new());
        }

        match self.finishing.as_mut().unwrap().poll(pq, ready)? {
            Step::Wait(w) => Ok(Step::Wait(w)),
            Step::Done(results) => {
                if results.len() != 1 {
                    return Err(Error::programming(
                        "you cannot mix COPY with other operations",
                    ));
                }
                let result = results.into_iter().next().unwrap();
                if result.status() != ExecStatus::CommandOk {
                    return Err(Error::from_result(&result));
                }
                Ok(Step::Done(CopyChunk::Done(result)))
            }
        }
    }
}

/// enqueue one buffer of COPY IN payload.
///
/// the caller is responsible for bounding the buffer size; oversized buffers
/// can keep reporting would-block forever.
pub(crate) struct CopyTo {
    pub(crate) data: Bytes,
}

impl<P: Pq> Machine<P> for CopyTo {
    type Output = ();

    fn poll(&mut self, pq: &mut P, _ready: Ready) -> Result<Step<()>, Error> {
        match pq.put_copy_data(&self.data)? {
            PutStatus::Queued => Ok(Step::Done(())),
            PutStatus::WouldBlock => Ok(Step::Wait(Wait::W)),
        }
    }
}

enum CopyEndPhase<P: Pq> {
    Put,
    Flush,
    Fetch(FetchMany<P>),
}

/// terminate a COPY IN, flush it out and collect the final result.
pub(crate) struct CopyEnd<P: Pq> {
    error: Option<String>,
    phase: CopyEndPhase<P>,
}

impl<P: Pq> CopyEnd<P> {
    pub(crate) fn new(error: Option<String>) -> Self {
        Self {
            error,
            phase: CopyEndPhase::Put,
        }
    }
}

impl<P: Pq> Machine<P> for CopyEnd<P> {
    type Output = P::Result;

    fn poll(&mut self, pq: &mut P, ready: Ready) -> Result<Step<Self::Output>, Error> {
        if let CopyEndPhase::Put = self.phase {
            match pq.put_copy_end(self.error.as_deref())? {
                PutStatus::WouldBlock => return Ok(Step::Wait(Wait::W)),
                PutStatus::Queued => self.phase = CopyEndPhase::Flush,
            }
        }

        if let CopyEndPhase::Flush = self.phase {
            match pq.flush()? {
                FlushStatus::WouldBlock => return Ok(Step::Wait(Wait::W)),
                FlushStatus::Done => self.phase = CopyEndPhase::Fetch(FetchMany::new()),
            }
        }

        let CopyEndPhase::Fetch(fetch) = &mut self.phase else {
            return Err(Error::internal("copy end machine in impossible phase"));
        };
        match fetch.poll(pq, ready)? {
            Step::Wait(w) => Ok(Step::Wait(w)),
            Step::Done(mut results) => {
                let result = results
                    .pop()
                    .ok_or_else(|| Error::internal("no result at the end of copy"))?;
                if result.status() != ExecStatus::CommandOk {
                    return Err(Error::from_result(&result));
                }
                Ok(Step::Done(result))
            }
        }
    }
}

/// wait for one round of input and drain the accumulated notifications.
pub(crate) struct Notifies {
    waited: bool,
}

impl Notifies {
    pub(crate) fn new() -> Self {
        Self { waited: false }
    }
}

impl<P: Pq> Machine<P> for Notifies {
    type Output = Vec<crate::pq::Notify>;

    fn poll(&mut self, pq: &mut P, _ready: Ready) -> Result<Step<Self::Output>, Error> {
        if !self.waited {
            self.waited = true;
            return Ok(Step::Wait(Wait::R));
        }
        pq.consume_input()?;
        let mut out = Vec::new();
        while let Some(n) = pq.notifies() {
            out.push(n);
        }
        Ok(Step::Done(out))
    }
}

/// a queued pipeline send operation, bound to the handle when executed.
// spelled out: the local `Send` machine shadows the marker trait here.
pub(crate) type PipelineCommand<P> =
    Box<dyn FnOnce(&mut P) -> Result<(), Error> + std::marker::Send>;

/// drive a pipeline until the command queue drains.
///
/// returns one entry per completed command in queue order: `Some(results)`
/// for regular commands, `None` for acknowledged sync points. Results of
/// commands still in flight when the queue empties are left in the handle
/// for a later fetch round.
pub(crate) struct PipelineCommunicate<P: Pq> {
    commands: VecDeque<PipelineCommand<P>>,
    results: Vec<Option<Vec<P::Result>>>,
    current: Vec<P::Result>,
}

impl<P: Pq> PipelineCommunicate<P> {
    pub(crate) fn new(commands: VecDeque<PipelineCommand<P>>) -> Self {
        Self {
            commands,
            results: Vec::new(),
            current: Vec::new(),
        }
    }
}

impl<P: Pq> Machine<P> for PipelineCommunicate<P> {
    type Output = Vec<Option<Vec<P::Result>>>;

    fn poll(&mut self, pq: &mut P, ready: Ready) -> Result<Step<Self::Output>, Error> {
        if ready.readable() {
            pq.consume_input()?;
            while !pq.is_busy() {
                match pq.get_result() {
                    None => {
                        if self.current.is_empty() {
                            break;
                        }
                        self.results.push(Some(mem::take(&mut self.current)));
                    }
                    Some(res) if res.status() == ExecStatus::PipelineSync => {
                        self.results.push(None);
                    }
                    Some(res) => self.current.push(res),
                }
            }
        }

        match pq.flush()? {
            FlushStatus::WouldBlock => return Ok(Step::Wait(Wait::Rw)),
            FlushStatus::Done => {}
        }

        while let Some(cmd) = self.commands.pop_front() {
            cmd(pq)?;
            if pq.flush()? == FlushStatus::WouldBlock {
                return Ok(Step::Wait(Wait::Rw));
            }
        }

        Ok(Step::Done(mem::take(&mut self.results)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pq::mock::{MockPq, MockResult};

    fn drive<M: Machine<MockPq>>(pq: &mut MockPq, mut m: M) -> Result<M::Output, Error> {
        let mut spins = 0;
        loop {
            match m.poll(pq, Ready::Rw)? {
                Step::Done(v) => return Ok(v),
                Step::Wait(_) => {
                    spins += 1;
                    assert!(spins < 64, "machine did not settle against mock handle");
                }
            }
        }
    }

    #[test]
    fn execute_collects_results_until_exhausted() {
        let mut pq = MockPq::connected();
        pq.expect(vec![MockResult::command_ok("SELECT 1")]);
        pq.send_query(b"select 1").unwrap();

        let results = drive(&mut pq, Execute::<MockPq>::new()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), ExecStatus::CommandOk);
    }

    #[test]
    fn fetch_many_stops_at_copy_status() {
        let mut pq = MockPq::connected();
        pq.expect(vec![
            MockResult::with_status(ExecStatus::CopyIn),
            MockResult::command_ok("phantom"),
        ]);
        pq.send_query(b"copy t from stdin").unwrap();

        let results = drive(&mut pq, Execute::<MockPq>::new()).unwrap();
        assert_eq!(results.len(), 1, "must stop at the COPY result");
        assert_eq!(results[0].status(), ExecStatus::CopyIn);
    }
}
