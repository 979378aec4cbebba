//! Behavioural tests for the dispatch loop and its watch set.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::errno::Errno;
use nix::unistd::Pid;
use rstest::{fixture, rstest};

use super::connection::{CommandOutcome, SpawnRequest};
use super::errors::{AcceptError, PeerError, PollError, ServeError};
use super::select_loop::{
    Acceptor, CommandPeer, LoopStep, ReadinessPoller, SelectLoop, SocketAcceptor, WatchSet,
};
use super::socket::CommandSocket;
use crate::spawn::{ForkOutcome, SpawnError, Spawner, WorkerTakeover};

const LISTENER_FD: RawFd = 10;

#[derive(Clone, Copy)]
enum ScriptedOutcome {
    KeepOpen,
    Finished,
    Handoff,
    Fail,
}

/// Peer double that replays scripted outcomes and counts steps and
/// closes. The descriptor value is symbolic; scripted pollers never hand
/// it to the kernel.
struct FakePeer {
    fd: RawFd,
    script: VecDeque<ScriptedOutcome>,
    steps: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl FakePeer {
    fn new(fd: RawFd, script: &[ScriptedOutcome]) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let steps = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let peer = Self {
            fd,
            script: script.iter().copied().collect(),
            steps: Arc::clone(&steps),
            closed: Arc::clone(&closed),
        };
        (peer, steps, closed)
    }
}

impl AsRawFd for FakePeer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl CommandPeer for FakePeer {
    fn process_one(&mut self, _spawner: &mut dyn Spawner) -> Result<CommandOutcome, PeerError> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front().expect("peer script exhausted") {
            ScriptedOutcome::KeepOpen => Ok(CommandOutcome::KeepOpen),
            ScriptedOutcome::Finished => Ok(CommandOutcome::Finished),
            ScriptedOutcome::Handoff => Ok(CommandOutcome::WorkerHandoff(WorkerTakeover::new(
                SpawnRequest {
                    args: vec!["scripted".to_string()],
                    abi: None,
                },
            ))),
            ScriptedOutcome::Fail => Err(PeerError::Read {
                source: io::Error::other("scripted failure"),
            }),
        }
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

enum AcceptScript {
    Peer(FakePeer),
    Transient,
    Fatal,
}

struct FakeAcceptor {
    script: VecDeque<AcceptScript>,
    accepts: Arc<AtomicUsize>,
}

impl FakeAcceptor {
    fn new(script: Vec<AcceptScript>) -> (Self, Arc<AtomicUsize>) {
        let accepts = Arc::new(AtomicUsize::new(0));
        let acceptor = Self {
            script: script.into_iter().collect(),
            accepts: Arc::clone(&accepts),
        };
        (acceptor, accepts)
    }
}

impl Acceptor for FakeAcceptor {
    type Peer = FakePeer;

    fn accept_one(&mut self) -> Result<FakePeer, AcceptError> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front().expect("accept script exhausted") {
            AcceptScript::Peer(peer) => Ok(peer),
            AcceptScript::Transient => Err(AcceptError::Io {
                socket: "fake".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionAborted),
            }),
            AcceptScript::Fatal => Err(AcceptError::Io {
                socket: "fake".to_string(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            }),
        }
    }

    fn fd(&self) -> RawFd {
        LISTENER_FD
    }
}

struct ScriptedPoller {
    rounds: VecDeque<Vec<bool>>,
}

impl ScriptedPoller {
    fn new(rounds: Vec<Vec<bool>>) -> Self {
        Self {
            rounds: rounds.into_iter().collect(),
        }
    }

    fn failing() -> Self {
        Self {
            rounds: VecDeque::new(),
        }
    }
}

impl ReadinessPoller for ScriptedPoller {
    fn wait(&mut self, descriptors: &[RawFd]) -> Result<Vec<bool>, PollError> {
        let Some(round) = self.rounds.pop_front() else {
            return Err(PollError::Wait {
                source: Errno::EBADF,
            });
        };
        assert_eq!(
            round.len(),
            descriptors.len(),
            "scripted round does not match the watch set"
        );
        Ok(round)
    }
}

/// Spawner double for dispatcher tests; peers are scripted, so this is
/// only ever consulted through them.
struct NoopSpawner;

impl Spawner for NoopSpawner {
    fn spawn(&mut self, _request: &SpawnRequest) -> Result<ForkOutcome, SpawnError> {
        Ok(ForkOutcome::Parent {
            child: Pid::from_raw(99),
        })
    }
}

fn scripted_loop(
    acceptor: FakeAcceptor,
    rounds: Vec<Vec<bool>>,
) -> SelectLoop<FakeAcceptor, ScriptedPoller> {
    SelectLoop::new(acceptor, ScriptedPoller::new(rounds), Box::new(NoopSpawner))
}

#[fixture]
fn empty_acceptor() -> FakeAcceptor {
    FakeAcceptor::new(Vec::new()).0
}

#[test]
fn watch_set_keeps_the_sentinel_at_index_zero() {
    let mut watch: WatchSet<FakePeer> = WatchSet::new(LISTENER_FD);
    let (first, _, _) = FakePeer::new(11, &[]);
    let (second, _, _) = FakePeer::new(12, &[]);
    watch.push_peer(first);
    watch.push_peer(second);

    assert_eq!(watch.len(), 3);
    assert_eq!(watch.descriptors(), vec![LISTENER_FD, 11, 12]);
    assert_eq!(watch.listener_fd(), LISTENER_FD);
    assert!(watch.peer_mut(0).is_none(), "sentinel has no owning peer");
    assert!(
        watch.remove_peer(0).is_none(),
        "sentinel must not be removable"
    );
    assert_eq!(watch.len(), 3);
}

#[test]
fn accepting_n_peers_yields_n_plus_one_entries() {
    let (first, _, _) = FakePeer::new(11, &[]);
    let (second, _, _) = FakePeer::new(12, &[]);
    let (third, _, _) = FakePeer::new(13, &[]);
    let (acceptor, accepts) = FakeAcceptor::new(vec![
        AcceptScript::Peer(first),
        AcceptScript::Peer(second),
        AcceptScript::Peer(third),
    ]);
    let mut select_loop = scripted_loop(
        acceptor,
        vec![
            vec![true],
            vec![true, false],
            vec![true, false, false],
        ],
    );

    for expected in [2_usize, 3, 4] {
        assert!(matches!(
            select_loop.run_once().expect("pass should succeed"),
            LoopStep::Continue
        ));
        assert_eq!(select_loop.watch().len(), expected);
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 3);
}

#[rstest]
fn only_the_ready_peer_is_stepped(empty_acceptor: FakeAcceptor) {
    let (idle, idle_steps, _) = FakePeer::new(11, &[ScriptedOutcome::KeepOpen]);
    let (ready, ready_steps, _) = FakePeer::new(12, &[ScriptedOutcome::KeepOpen]);
    let mut select_loop = scripted_loop(empty_acceptor, vec![vec![false, false, true]]);
    select_loop.watch_mut().push_peer(idle);
    select_loop.watch_mut().push_peer(ready);

    select_loop.run_once().expect("pass should succeed");

    assert_eq!(idle_steps.load(Ordering::SeqCst), 0);
    assert_eq!(ready_steps.load(Ordering::SeqCst), 1);
    assert_eq!(select_loop.watch().len(), 3);
}

#[rstest]
fn finished_peer_is_removed_and_closed_exactly_once(empty_acceptor: FakeAcceptor) {
    let (peer, steps, closed) = FakePeer::new(11, &[ScriptedOutcome::Finished]);
    let mut select_loop = scripted_loop(empty_acceptor, vec![vec![false, true]]);
    select_loop.watch_mut().push_peer(peer);

    select_loop.run_once().expect("pass should succeed");

    assert_eq!(steps.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1, "exactly one close");
    assert_eq!(select_loop.watch().len(), 1);
}

#[rstest]
fn worker_handoff_unwinds_without_reentering_the_loop(empty_acceptor: FakeAcceptor) {
    let (survivor, survivor_steps, survivor_closed) =
        FakePeer::new(11, &[ScriptedOutcome::KeepOpen]);
    let (spawning, _, spawning_closed) = FakePeer::new(12, &[ScriptedOutcome::Handoff]);
    let mut select_loop = scripted_loop(empty_acceptor, vec![vec![false, true, true]]);
    select_loop.watch_mut().push_peer(survivor);
    select_loop.watch_mut().push_peer(spawning);

    let step = select_loop.run_once().expect("pass should succeed");
    let LoopStep::Worker(takeover) = step else {
        panic!("expected a worker takeover");
    };
    assert_eq!(takeover.request().args, ["scripted"]);
    assert_eq!(
        spawning_closed.load(Ordering::SeqCst),
        1,
        "the worker releases its own peer slot first"
    );
    // The scan aborts as soon as control belongs to the worker; no other
    // peer is stepped afterwards.
    assert_eq!(survivor_steps.load(Ordering::SeqCst), 0);

    // Unwinding drops the loop, which releases every remaining
    // server-owned descriptor exactly once.
    drop(select_loop);
    assert_eq!(survivor_closed.load(Ordering::SeqCst), 1);
}

#[rstest]
fn failing_peer_is_dropped_while_others_continue(empty_acceptor: FakeAcceptor) {
    let (broken, _, broken_closed) = FakePeer::new(11, &[ScriptedOutcome::Fail]);
    let (healthy, healthy_steps, _) =
        FakePeer::new(12, &[ScriptedOutcome::KeepOpen, ScriptedOutcome::KeepOpen]);
    let mut select_loop = scripted_loop(
        empty_acceptor,
        vec![vec![false, true, true], vec![false, true]],
    );
    select_loop.watch_mut().push_peer(broken);
    select_loop.watch_mut().push_peer(healthy);

    select_loop.run_once().expect("first pass should succeed");
    assert_eq!(broken_closed.load(Ordering::SeqCst), 1);
    assert_eq!(select_loop.watch().len(), 2);

    // The surviving peer is still serviced on the next pass.
    select_loop.run_once().expect("second pass should succeed");
    assert_eq!(healthy_steps.load(Ordering::SeqCst), 2);
}

#[rstest]
fn removal_during_a_pass_preserves_unvisited_entries(empty_acceptor: FakeAcceptor) {
    let (keeper, keeper_steps, _) = FakePeer::new(11, &[ScriptedOutcome::KeepOpen]);
    let (middle, _, middle_closed) = FakePeer::new(12, &[ScriptedOutcome::Finished]);
    let (tail, _, tail_closed) = FakePeer::new(13, &[ScriptedOutcome::Finished]);
    let mut select_loop = scripted_loop(empty_acceptor, vec![vec![false, true, true, true]]);
    select_loop.watch_mut().push_peer(keeper);
    select_loop.watch_mut().push_peer(middle);
    select_loop.watch_mut().push_peer(tail);

    select_loop.run_once().expect("pass should succeed");

    assert_eq!(middle_closed.load(Ordering::SeqCst), 1);
    assert_eq!(tail_closed.load(Ordering::SeqCst), 1);
    assert_eq!(keeper_steps.load(Ordering::SeqCst), 1);
    assert_eq!(select_loop.watch().descriptors(), vec![LISTENER_FD, 11]);
}

#[test]
fn transient_accept_failures_do_not_kill_the_server() {
    let (acceptor, accepts) = FakeAcceptor::new(vec![AcceptScript::Transient]);
    let mut select_loop = scripted_loop(acceptor, vec![vec![true]]);

    assert!(matches!(
        select_loop.run_once().expect("pass should succeed"),
        LoopStep::Continue
    ));
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(select_loop.watch().len(), 1);
}

#[test]
fn fatal_accept_failures_terminate_the_loop() {
    let (acceptor, _) = FakeAcceptor::new(vec![AcceptScript::Fatal]);
    let mut select_loop = scripted_loop(acceptor, vec![vec![true]]);

    let error = select_loop.run_once().expect_err("pass should fail");
    assert!(matches!(error, ServeError::Accept(_)));
}

#[rstest]
fn poll_failure_is_fatal(empty_acceptor: FakeAcceptor) {
    let mut select_loop = SelectLoop::new(
        empty_acceptor,
        ScriptedPoller::failing(),
        Box::new(NoopSpawner),
    );

    let error = select_loop.run_once().expect_err("pass should fail");
    assert!(matches!(error, ServeError::Poll(_)));
}

#[test]
fn accepting_a_connection_grows_the_watch_set() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("hatch.sock");
    let listener = UnixListener::bind(&path).expect("bind listener");
    let socket = CommandSocket::new(listener.into(), "hatch");
    let abi_list: Arc<[String]> = vec!["x86_64".to_string()].into();
    let acceptor = SocketAcceptor::new(socket, abi_list);
    let mut select_loop = SelectLoop::new(
        acceptor,
        ScriptedPoller::new(vec![vec![true]]),
        Box::new(NoopSpawner),
    );
    assert_eq!(select_loop.watch().len(), 1);

    let _client = UnixStream::connect(&path).expect("connect client");
    select_loop.run_once().expect("pass should succeed");

    assert_eq!(select_loop.watch().len(), 2);
    let descriptors = select_loop.watch().descriptors();
    let accepted_fd = select_loop
        .watch_mut()
        .peer_mut(1)
        .expect("accepted peer registered")
        .as_raw_fd();
    assert_eq!(descriptors.get(1).copied(), Some(accepted_fd));
}
