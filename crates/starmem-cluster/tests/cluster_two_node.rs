//! End-to-end scenarios over loopback TCP: a real master and a real
//! slave in one process, sharing an in-memory object store.
//!
//! The fake peers in the liveness and framing tests speak the wire
//! protocol byte-by-byte on purpose — they double as conformance checks
//! that the handshake and packet layout match what an independent
//! implementation would produce.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use starmem_cluster::{
    transport, Checkpointing, ClusterConfig, ClusterHandle, ClusterRuntime, InMemoryStore,
    MasterNode, MasterStart, ProcessControl, SlaveNode, WorkerEntry,
};
use starmem_error::Result;
use starmem_types::command::{Command, CommandPacket};
use starmem_types::limits::{MASTER_MAGIC, SLAVE_MAGIC, SLOT_EVENT_SIGNALED, SLOT_PRIMITIVE_INIT};
use starmem_types::topology::{BackendKind, CacheKind, ClusterMap, PeerAddr, StorageMap};
use starmem_types::{NodeId, ObjectKey};

// ── Harness ────────────────────────────────────────────────────────────

type EntryFn = dyn Fn(&ClusterHandle, u32, u32, ObjectKey, Option<Vec<u8>>) + Send + Sync;

struct ScriptEntry(Box<EntryFn>);

impl WorkerEntry for ScriptEntry {
    fn run(&self, cluster: &ClusterHandle, index: u32, param: u32, key: ObjectKey) {
        (self.0)(cluster, index, param, key, None);
    }

    fn run_with_payload(
        &self,
        cluster: &ClusterHandle,
        index: u32,
        param: u32,
        key: ObjectKey,
        payload: Vec<u8>,
    ) {
        (self.0)(cluster, index, param, key, Some(payload));
    }
}

fn script_entry(
    f: impl Fn(&ClusterHandle, u32, u32, ObjectKey, Option<Vec<u8>>) + Send + Sync + 'static,
) -> Arc<dyn WorkerEntry> {
    Arc::new(ScriptEntry(Box::new(f)))
}

struct TwoNode {
    master: MasterNode,
    slave: JoinHandle<Result<()>>,
}

fn start_two_node(store: &Arc<InMemoryStore>, slave_entry: Arc<dyn WorkerEntry>) -> TwoNode {
    let listener = transport::listen(0).expect("slave listener");
    let port = listener.local_addr().expect("local addr").port();

    let mut slave_runtime =
        ClusterRuntime::in_process(Arc::clone(store) as Arc<dyn starmem_cluster::SharedStore>);
    slave_runtime.entry = slave_entry;
    let slave = thread::spawn(move || SlaveNode::serve(&listener, slave_runtime));

    let cluster = ClusterMap::new(vec![
        PeerAddr::new("127.0.0.1", 0),
        PeerAddr::new("127.0.0.1", port),
    ]);
    let master_runtime =
        ClusterRuntime::in_process(Arc::clone(store) as Arc<dyn starmem_cluster::SharedStore>);
    let started = MasterNode::start(
        cluster,
        StorageMap::default(),
        BackendKind(0),
        CacheKind(0),
        master_runtime,
        ClusterConfig::default(),
    )
    .expect("master start");
    let MasterStart::Running(master) = started else {
        panic!("no checkpoint was pending");
    };
    TwoNode { master, slave }
}

fn close(nodes: TwoNode) {
    nodes.master.shutdown().expect("graceful shutdown");
    nodes
        .slave
        .join()
        .expect("slave thread")
        .expect("slave served until close");
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

const SLAVE: NodeId = NodeId::new(1);

// ── Barrier ────────────────────────────────────────────────────────────

#[test]
fn test_two_node_barrier_trips_and_is_reusable() {
    let key = ObjectKey::new(100);
    let store = Arc::new(InMemoryStore::new());
    store.put(key, SLOT_PRIMITIVE_INIT, 2);

    let worker_results = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&worker_results);
    let entry = script_entry(move |cluster, rounds, _param, key, _payload| {
        for _ in 0..rounds {
            let released = cluster
                .enter_barrier(key, Duration::from_secs(10))
                .expect("barrier call");
            recorded.lock().push(released);
        }
    });

    let nodes = start_two_node(&store, entry);
    let handle = nodes.master.handle().clone();
    handle.register_thread();

    nodes
        .master
        .create_remote_thread(SLAVE, 2, 0, key)
        .expect("spawn remote worker");

    // Round one, then immediately again: the counter must have reset.
    assert!(handle.enter_barrier(key, Duration::from_secs(10)).unwrap());
    assert!(handle.enter_barrier(key, Duration::from_secs(10)).unwrap());

    assert!(wait_until(
        || worker_results.lock().len() == 2,
        Duration::from_secs(5)
    ));
    assert!(worker_results.lock().iter().all(|&released| released));

    handle.deregister_thread();
    close(nodes);
}

// ── Semaphore as mutex ─────────────────────────────────────────────────

#[test]
fn test_semaphore_mutex_across_nodes() {
    let key = ObjectKey::new(200);
    let store = Arc::new(InMemoryStore::new());
    store.put(key, SLOT_PRIMITIVE_INIT, 1);

    let counter = Arc::new(AtomicU32::new(0));
    let in_critical = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicU32::new(0));

    let critical_section = {
        let counter = Arc::clone(&counter);
        let in_critical = Arc::clone(&in_critical);
        let violations = Arc::clone(&violations);
        move |cluster: &ClusterHandle, key: ObjectKey| {
            assert!(cluster
                .enter_semaphore(key, Duration::from_secs(30))
                .expect("acquire"));
            if in_critical.swap(true, Ordering::SeqCst) {
                violations.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(10));
            counter.fetch_add(1, Ordering::SeqCst);
            in_critical.store(false, Ordering::SeqCst);
            cluster.leave_semaphore(key).expect("release");
        }
    };

    let worker_section = critical_section.clone();
    let entry = script_entry(move |cluster, _index, _param, key, _payload| {
        worker_section(cluster, key);
    });

    let nodes = start_two_node(&store, entry);
    let handle = nodes.master.handle().clone();
    handle.register_thread();

    for _ in 0..2 {
        nodes
            .master
            .create_remote_thread(SLAVE, 0, 0, key)
            .expect("spawn contender");
    }
    critical_section(&handle, key);

    assert!(wait_until(
        || counter.load(Ordering::SeqCst) == 3,
        Duration::from_secs(10)
    ));
    assert_eq!(violations.load(Ordering::SeqCst), 0, "two holders overlapped");

    handle.deregister_thread();
    close(nodes);
}

// ── Auto-reset event storm ─────────────────────────────────────────────

#[test]
fn test_auto_reset_event_wakes_one_per_set() {
    let key = ObjectKey::new(300);
    let store = Arc::new(InMemoryStore::new());
    store.put(key, SLOT_PRIMITIVE_INIT, 1); // auto-reset
    store.put(key, SLOT_EVENT_SIGNALED, 0);

    let done = Arc::new(AtomicU32::new(0));
    let worker_done = Arc::clone(&done);
    let entry = script_entry(move |cluster, _index, _param, key, _payload| {
        if cluster
            .wait_for_event(key, Duration::from_secs(30))
            .expect("wait")
        {
            worker_done.fetch_add(1, Ordering::SeqCst);
        }
    });

    let nodes = start_two_node(&store, entry);
    let handle = nodes.master.handle().clone();

    // Four remote waiters plus one master-local waiter.
    for _ in 0..4 {
        nodes
            .master
            .create_remote_thread(SLAVE, 0, 0, key)
            .expect("spawn waiter");
    }
    let local_done = Arc::clone(&done);
    let local_handle = handle.clone();
    let local = thread::spawn(move || {
        local_handle.register_thread();
        if local_handle
            .wait_for_event(key, Duration::from_secs(30))
            .expect("wait")
        {
            local_done.fetch_add(1, Ordering::SeqCst);
        }
        local_handle.deregister_thread();
    });

    thread::sleep(Duration::from_millis(200));
    // One set, one return: the latch holds a single pending signal, so
    // each set is confirmed before the next goes out.
    for sets in 1..=5 {
        handle.set_event(key).expect("set");
        assert!(wait_until(
            || done.load(Ordering::SeqCst) >= sets,
            Duration::from_secs(10)
        ));
    }
    assert_eq!(done.load(Ordering::SeqCst), 5);
    local.join().expect("local waiter");
    close(nodes);
}

// ── Manual-reset event broadcast ───────────────────────────────────────

#[test]
fn test_manual_reset_event_broadcast_and_reset() {
    let key = ObjectKey::new(400);
    let store = Arc::new(InMemoryStore::new());
    store.put(key, SLOT_PRIMITIVE_INIT, 0); // manual reset
    store.put(key, SLOT_EVENT_SIGNALED, 0);

    let done = Arc::new(AtomicU32::new(0));
    let worker_done = Arc::clone(&done);
    let entry = script_entry(move |cluster, _index, _param, key, _payload| {
        if cluster
            .wait_for_event(key, Duration::from_secs(30))
            .expect("wait")
        {
            worker_done.fetch_add(1, Ordering::SeqCst);
        }
    });

    let nodes = start_two_node(&store, entry);
    let handle = nodes.master.handle().clone();
    handle.register_thread();

    for _ in 0..4 {
        nodes
            .master
            .create_remote_thread(SLAVE, 0, 0, key)
            .expect("spawn waiter");
    }
    thread::sleep(Duration::from_millis(200));

    handle.set_event(key).expect("set");
    assert!(
        wait_until(|| done.load(Ordering::SeqCst) == 4, Duration::from_secs(10)),
        "one set must release every current waiter"
    );

    // Late waiter passes straight through while signaled.
    assert!(handle.wait_for_event(key, Duration::from_secs(5)).unwrap());

    // After a reset, waiters block again.
    handle.reset_event(key).expect("reset");
    assert!(!handle.wait_for_event(key, Duration::from_millis(300)).unwrap());

    handle.deregister_thread();
    close(nodes);
}

// ── Liveness-triggered restart ─────────────────────────────────────────

struct TrivialCheckpoint;

impl Checkpointing for TrivialCheckpoint {
    fn pending_checkpoint(&self) -> i32 {
        -1
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        Ok(())
    }

    fn restore(&self, _checkpoint: i32) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingProcess {
    restarts: Mutex<Vec<Vec<PeerAddr>>>,
}

impl ProcessControl for RecordingProcess {
    fn restart(&self, excludes: &[PeerAddr]) {
        self.restarts.lock().push(excludes.to_vec());
    }
}

/// Byte-level slave that completes the handshake and then never answers
/// another probe.
fn spawn_silent_slave() -> (u16, JoinHandle<()>) {
    let listener = transport::listen(0).expect("silent slave listener");
    let port = listener.local_addr().expect("local addr").port();
    let join = thread::spawn(move || {
        let (mut sock, _) = listener.accept().expect("accept master");
        sock.write_all(&SLAVE_MAGIC.to_ne_bytes()).expect("magic");
        let mut hello = [0u8; 32];
        sock.read_exact(&mut hello).expect("master hello");
        assert_eq!(
            u32::from_ne_bytes(hello[0..4].try_into().unwrap()),
            MASTER_MAGIC
        );
        let num_mem = u32::from_ne_bytes(hello[4..8].try_into().unwrap());
        let num_nodes = u32::from_ne_bytes(hello[8..12].try_into().unwrap());
        for _ in 0..(num_nodes - 1 + num_mem) {
            let mut len_buf = [0u8; 4];
            sock.read_exact(&mut len_buf).expect("record len");
            let len = u32::from_ne_bytes(len_buf) as usize;
            let mut host = vec![0u8; len];
            sock.read_exact(&mut host).expect("record host");
            let mut port_buf = [0u8; 4];
            sock.read_exact(&mut port_buf).expect("record port");
        }
        // Handshake done. Go catatonic: probes pile up unread until the
        // master gives up on us.
        thread::sleep(Duration::from_secs(20));
    });
    (port, join)
}

#[test]
fn test_silent_peer_triggers_cluster_restart_with_exclusion() {
    let store = Arc::new(InMemoryStore::new());

    // Slave 1 is a real, responsive node.
    let live_listener = transport::listen(0).expect("live slave listener");
    let live_port = live_listener.local_addr().expect("local addr").port();
    let slave_process = Arc::new(RecordingProcess::default());
    let mut slave_runtime =
        ClusterRuntime::in_process(Arc::clone(&store) as Arc<dyn starmem_cluster::SharedStore>);
    slave_runtime.process = Arc::clone(&slave_process) as Arc<dyn ProcessControl>;
    let live_slave = thread::spawn(move || SlaveNode::serve(&live_listener, slave_runtime));

    // Slave 2 handshakes and then never answers anything again.
    let (silent_port, _silent) = spawn_silent_slave();

    let master_process = Arc::new(RecordingProcess::default());
    let mut master_runtime =
        ClusterRuntime::in_process(Arc::clone(&store) as Arc<dyn starmem_cluster::SharedStore>);
    master_runtime.checkpoint = Some(Arc::new(TrivialCheckpoint));
    master_runtime.process = Arc::clone(&master_process) as Arc<dyn ProcessControl>;

    let cluster = ClusterMap::new(vec![
        PeerAddr::new("127.0.0.1", 0),
        PeerAddr::new("127.0.0.1", live_port),
        PeerAddr::new("127.0.0.1", silent_port),
    ]);
    let config = ClusterConfig {
        probe_interval: Duration::from_millis(50),
        liveness_timeout: Duration::from_millis(250),
        restart_grace: Duration::from_millis(10),
    };
    let started = MasterNode::start(
        cluster,
        StorageMap::default(),
        BackendKind(0),
        CacheKind(0),
        master_runtime,
        config,
    )
    .expect("master start");
    let MasterStart::Running(master) = started else {
        panic!("no checkpoint was pending");
    };

    assert!(
        wait_until(
            || !master_process.restarts.lock().is_empty(),
            Duration::from_secs(10)
        ),
        "failure detector must condemn the generation"
    );
    let excludes = master_process.restarts.lock()[0].clone();
    assert_eq!(excludes, vec![PeerAddr::new("127.0.0.1", silent_port)]);

    // The live slave got the Restart broadcast and invoked its own
    // process restart with no exclusions.
    assert!(wait_until(
        || !slave_process.restarts.lock().is_empty(),
        Duration::from_secs(5)
    ));
    assert_eq!(slave_process.restarts.lock()[0], Vec::<PeerAddr>::new());

    master.shutdown().expect("shutdown");
    live_slave
        .join()
        .expect("live slave thread")
        .expect("live slave served until close");
}

// ── Oversized thread payload ───────────────────────────────────────────

fn raw_master_hello(num_nodes: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(MASTER_MAGIC.to_ne_bytes());
    out.extend(0u32.to_ne_bytes()); // storage servers
    out.extend(num_nodes.to_ne_bytes());
    out.extend(1u32.to_ne_bytes()); // this slave's node id
    out.extend(0i32.to_ne_bytes()); // master listen port
    out.extend(0u32.to_ne_bytes()); // backend
    out.extend(0u32.to_ne_bytes()); // cache
    out.extend((-1i32).to_ne_bytes()); // no pending checkpoint
    out
}

fn raw_peer_record(host: &str, port: u16) -> Vec<u8> {
    let mut out = Vec::new();
    let mut bytes = host.as_bytes().to_vec();
    bytes.push(0);
    out.extend(u32::try_from(bytes.len()).unwrap().to_ne_bytes());
    out.extend(bytes);
    out.extend(u32::from(port).to_ne_bytes());
    out
}

#[test]
fn test_oversized_payload_is_dropped_and_stream_stays_framed() {
    let store = Arc::new(InMemoryStore::new());
    let runs = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&runs);
    let entry = script_entry(move |_cluster, index, param, _key, payload| {
        recorded.lock().push((index, param, payload));
    });

    let listener = transport::listen(0).expect("slave listener");
    let addr = listener.local_addr().expect("local addr");
    let mut slave_runtime =
        ClusterRuntime::in_process(Arc::clone(&store) as Arc<dyn starmem_cluster::SharedStore>);
    slave_runtime.entry = entry;
    let slave = thread::spawn(move || SlaveNode::serve(&listener, slave_runtime));

    // Act as the master, byte for byte.
    let mut sock = TcpStream::connect(addr).expect("dial slave");
    sock.set_nodelay(true).expect("nodelay");
    let mut magic = [0u8; 4];
    sock.read_exact(&mut magic).expect("slave magic");
    assert_eq!(u32::from_ne_bytes(magic), SLAVE_MAGIC);
    sock.write_all(&raw_master_hello(2)).expect("hello");
    sock.write_all(&raw_peer_record("127.0.0.1", addr.port()))
        .expect("peer record");

    // An over-limit payload: must be refused without spawning, and must
    // not desynchronize the 3000 bytes that follow the header.
    let oversize = CommandPacket::create_thread(9, 9, ObjectKey::new(1), 3000);
    sock.write_all(&oversize.to_bytes()).expect("oversize header");
    sock.write_all(&vec![0xEE; 3000]).expect("oversize body");

    // A well-formed command right behind it must still be served.
    let good = CommandPacket::create_thread(1, 2, ObjectKey::new(3), 8);
    sock.write_all(&good.to_bytes()).expect("good header");
    sock.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).expect("good body");

    assert!(wait_until(|| runs.lock().len() == 1, Duration::from_secs(5)));
    {
        let runs = runs.lock();
        assert_eq!(runs.len(), 1, "the oversize request must not spawn");
        assert_eq!(runs[0].0, 1);
        assert_eq!(runs[0].1, 2);
        assert_eq!(runs[0].2.as_deref(), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
    }

    sock.write_all(&CommandPacket::bare(Command::Close).to_bytes())
        .expect("close");
    slave
        .join()
        .expect("slave thread")
        .expect("slave served until close");
}
