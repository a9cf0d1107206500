//! In-process fake cluster for tests
//!
//! Speaks real RESP bytes through the `NodeConnection` trait: commands are
//! decoded on flush, executed against one shared keyspace with per-node
//! slot ownership checks, and the replies queued in order. Failure knobs
//! cover unreachable nodes, dying connections, garbage frames, migrating
//! slots (ASK), flapping slots and server-side resharding (MOVED).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Cursor};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::client::{Connector, NodeConnection};
use crate::cluster::{slot_for_key, NodeAddress, SLOT_COUNT};
use crate::utils::{ConnectionError, ProtocolError, RespDecoder, RespValue, Result};

const BASE_PORT: u16 = 7000;

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
}

#[derive(Default)]
struct FakeNode {
    replica_of: Option<usize>,
    unreachable: bool,
    malformed: bool,
    generation: u64,
    connects: usize,
    log: Vec<String>,
    reported_slots: Option<RespValue>,
}

struct ClusterState {
    nodes: Vec<FakeNode>,
    owner: Vec<usize>,
    migrating: HashMap<u16, usize>,
    flapping: HashMap<u16, (usize, usize)>,
    data: HashMap<Vec<u8>, Value>,
    blocking_timeouts: Vec<Option<Duration>>,
    cluster_down: usize,
}

/// Shared handle to a fake cluster
#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    /// `masters` nodes splitting the slot space evenly, no replicas
    pub fn with_masters(masters: usize) -> Self {
        Self::with_topology(masters, 0)
    }

    /// Masters first (indices `0..masters`), then their replicas in order
    pub fn with_topology(masters: usize, replicas_per_master: usize) -> Self {
        let mut nodes: Vec<FakeNode> = (0..masters).map(|_| FakeNode::default()).collect();
        for _ in 0..replicas_per_master {
            for m in 0..masters {
                nodes.push(FakeNode {
                    replica_of: Some(m),
                    ..FakeNode::default()
                });
            }
        }
        let owner = (0..SLOT_COUNT).map(|s| s * masters / SLOT_COUNT).collect();

        Self {
            state: Arc::new(Mutex::new(ClusterState {
                nodes,
                owner,
                migrating: HashMap::new(),
                flapping: HashMap::new(),
                data: HashMap::new(),
                blocking_timeouts: Vec::new(),
                cluster_down: 0,
            })),
        }
    }

    pub fn address(&self, node: usize) -> NodeAddress {
        NodeAddress::new("127.0.0.1", BASE_PORT + node as u16)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            cluster: self.clone(),
        })
    }

    /// Number of connections opened to a node so far
    pub fn connects(&self, node: usize) -> usize {
        self.state.lock().nodes[node].connects
    }

    /// Node refuses new connections and existing ones fail
    pub fn set_unreachable(&self, node: usize, unreachable: bool) {
        let mut state = self.state.lock();
        state.nodes[node].unreachable = unreachable;
        state.nodes[node].generation += 1;
    }

    /// Existing connections to a node fail on next use; new ones work
    pub fn kill_connections(&self, node: usize) {
        self.state.lock().nodes[node].generation += 1;
    }

    /// Node answers every command with a malformed frame
    pub fn set_malformed(&self, node: usize, malformed: bool) {
        self.state.lock().nodes[node].malformed = malformed;
    }

    /// Override what a node answers to CLUSTER SLOTS
    pub fn set_reported_slots(&self, node: usize, reply: Option<RespValue>) {
        self.state.lock().nodes[node].reported_slots = reply;
    }

    /// Server-side resharding the client does not know about
    pub fn assign_slots(&self, start: u16, end: u16, node: usize) {
        let mut state = self.state.lock();
        for slot in start..=end {
            state.owner[slot as usize] = node;
        }
    }

    /// Owner answers ASK for this slot; target serves it after ASKING
    pub fn migrate_slot(&self, slot: u16, target: usize) {
        self.state.lock().migrating.insert(slot, target);
    }

    /// Every node answers MOVED for this slot, alternating between two nodes
    pub fn flap_slot(&self, slot: u16, a: usize, b: usize) {
        self.state.lock().flapping.insert(slot, (a, b));
    }

    /// Replica takes over its master's slots; the old master becomes its replica
    pub fn failover(&self, replica: usize) {
        let mut state = self.state.lock();
        let Some(master) = state.nodes[replica].replica_of else {
            return;
        };
        for owner in state.owner.iter_mut() {
            if *owner == master {
                *owner = replica;
            }
        }
        for node in state.nodes.iter_mut() {
            if node.replica_of == Some(master) {
                node.replica_of = Some(replica);
            }
        }
        state.nodes[replica].replica_of = None;
        state.nodes[master].replica_of = Some(replica);
    }

    /// The next `count` keyed commands are answered with CLUSTERDOWN
    pub fn set_cluster_down(&self, count: usize) {
        self.state.lock().cluster_down = count;
    }

    /// Commands a node received, rendered as space-separated words
    pub fn commands(&self, node: usize) -> Vec<String> {
        self.state.lock().nodes[node].log.clone()
    }

    pub fn clear_log(&self) {
        for node in self.state.lock().nodes.iter_mut() {
            node.log.clear();
        }
    }

    /// Read timeouts that were in effect when blocking replies were read
    pub fn blocking_timeouts(&self) -> Vec<Option<Duration>> {
        self.state.lock().blocking_timeouts.clone()
    }

    pub fn set_string(&self, key: &str, value: &str) {
        self.state
            .lock()
            .data
            .insert(key.as_bytes().to_vec(), Value::Str(value.as_bytes().to_vec()));
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.state.lock().data.get(key.as_bytes()) {
            Some(Value::Str(v)) => Some(String::from_utf8_lossy(v).into_owned()),
            _ => None,
        }
    }

    /// A key whose slot is served by `node`
    pub fn key_on(&self, node: usize, prefix: &str) -> String {
        let state = self.state.lock();
        (0..)
            .map(|i| format!("{}{}", prefix, i))
            .find(|k| state.owner[slot_for_key(k.as_bytes()) as usize] == node)
            .unwrap_or_default()
    }
}

struct FakeConnector {
    cluster: FakeCluster,
}

impl Connector for FakeConnector {
    fn connect(&self, address: &NodeAddress) -> Result<Box<dyn NodeConnection>> {
        let mut state = self.cluster.state.lock();
        let index = (address.host == "127.0.0.1")
            .then(|| address.port.checked_sub(BASE_PORT))
            .flatten()
            .map(|i| i as usize)
            .filter(|&i| i < state.nodes.len() && !state.nodes[i].unreachable);

        let Some(index) = index else {
            return Err(ConnectionError::ConnectFailed {
                host: address.host.clone(),
                port: address.port,
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            }
            .into());
        };

        let node = &mut state.nodes[index];
        node.connects += 1;
        Ok(Box::new(FakeConnection {
            cluster: self.cluster.clone(),
            address: address.clone(),
            index,
            generation: node.generation,
            outbound: Vec::new(),
            replies: VecDeque::new(),
            asking: false,
            timeout: Some(Duration::from_secs(2)),
            broken: false,
        }))
    }
}

enum Queued {
    Reply(RespValue, bool),
    Malformed,
}

struct FakeConnection {
    cluster: FakeCluster,
    address: NodeAddress,
    index: usize,
    generation: u64,
    outbound: Vec<u8>,
    replies: VecDeque<Queued>,
    asking: bool,
    timeout: Option<Duration>,
    broken: bool,
}

impl FakeConnection {
    fn io_failure(&mut self, message: &str) -> crate::utils::ClientError {
        self.broken = true;
        ConnectionError::Io {
            address: self.address.key(),
            source: io::Error::new(io::ErrorKind::ConnectionReset, message.to_string()),
        }
        .into()
    }

    fn is_alive(&self) -> bool {
        let state = self.cluster.state.lock();
        let node = &state.nodes[self.index];
        !node.unreachable && node.generation == self.generation
    }
}

impl NodeConnection for FakeConnection {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        if self.broken {
            return Err(ConnectionError::Closed(self.address.key()).into());
        }
        self.outbound.extend_from_slice(command);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.broken {
            return Err(ConnectionError::Closed(self.address.key()).into());
        }
        if !self.is_alive() {
            return Err(self.io_failure("connection reset by peer"));
        }

        let bytes = std::mem::take(&mut self.outbound);
        let mut decoder = RespDecoder::new(Cursor::new(bytes));
        loop {
            let frame = match decoder.decode() {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(self.io_failure(&e.to_string())),
            };
            let args: Vec<Vec<u8>> = frame
                .as_array()
                .unwrap_or_default()
                .iter()
                .filter_map(|a| a.as_bytes().map(|b| b.to_vec()))
                .collect();

            let mut state = self.cluster.state.lock();
            if state.nodes[self.index].malformed {
                self.replies.push_back(Queued::Malformed);
                continue;
            }
            let rendered = args
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            state.nodes[self.index].log.push(rendered);

            let blocking = args.first().map_or(false, |n| {
                n.eq_ignore_ascii_case(b"BLPOP") || n.eq_ignore_ascii_case(b"XREAD")
            });
            let reply = state.dispatch(self.index, &mut self.asking, &args);
            self.replies.push_back(Queued::Reply(reply, blocking));
        }
        Ok(())
    }

    fn read_reply(&mut self) -> Result<RespValue> {
        self.flush()?;
        match self.replies.pop_front() {
            Some(Queued::Reply(reply, blocking)) => {
                if blocking {
                    self.cluster.state.lock().blocking_timeouts.push(self.timeout);
                }
                Ok(reply)
            }
            Some(Queued::Malformed) => {
                self.broken = true;
                Err(ProtocolError::Malformed {
                    address: self.address.key(),
                    message: "Invalid RESP type byte: !".to_string(),
                }
                .into())
            }
            None => Err(self.io_failure("read timed out")),
        }
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn close(&mut self) {
        self.broken = true;
    }
}

fn ok() -> RespValue {
    RespValue::Status("OK".to_string())
}

fn err(msg: &str) -> RespValue {
    RespValue::Error(msg.to_string())
}

fn bulk(data: &[u8]) -> RespValue {
    RespValue::Bulk(Some(data.to_vec()))
}

fn wrongtype() -> RespValue {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn parse_int(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

impl ClusterState {
    fn node_address(index: usize) -> String {
        format!("127.0.0.1:{}", BASE_PORT + index as u16)
    }

    fn master_of(&self, index: usize) -> usize {
        self.nodes[index].replica_of.unwrap_or(index)
    }

    fn dispatch(&mut self, index: usize, asking: &mut bool, args: &[Vec<u8>]) -> RespValue {
        let Some(name) = args.first() else {
            return err("ERR empty command");
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        let was_asking = std::mem::replace(asking, false);

        match name.as_str() {
            "PING" => return RespValue::Status("PONG".to_string()),
            "ASKING" => {
                *asking = true;
                return ok();
            }
            "AUTH" | "SELECT" | "READONLY" => return ok(),
            "CLUSTER" => return self.cluster_slots(index),
            _ => {}
        }

        let keys = command_keys(&name, args);
        let Some(first) = keys.first() else {
            return self.execute(&name, args);
        };
        let slot = slot_for_key(first);
        if keys.iter().any(|k| slot_for_key(k) != slot) {
            return err("CROSSSLOT Keys in request don't hash to the same slot");
        }
        if self.cluster_down > 0 {
            self.cluster_down -= 1;
            return err("CLUSTERDOWN The cluster is down");
        }

        if let Some(&(a, b)) = self.flapping.get(&slot) {
            let target = if index == a { b } else { a };
            return err(&format!("MOVED {} {}", slot, Self::node_address(target)));
        }

        let owner = self.owner[slot as usize];
        if let Some(&target) = self.migrating.get(&slot) {
            if index == owner {
                return err(&format!("ASK {} {}", slot, Self::node_address(target)));
            }
            if index == target && was_asking {
                return self.execute(&name, args);
            }
        }

        let is_write = !matches!(
            name.as_str(),
            "GET" | "MGET" | "STRLEN" | "EXISTS" | "TTL" | "TYPE" | "LRANGE" | "LLEN" | "HGET"
                | "HGETALL" | "ECHO"
        );
        let serves = index == owner || (!is_write && self.master_of(index) == owner);
        if !serves {
            return err(&format!("MOVED {} {}", slot, Self::node_address(owner)));
        }
        self.execute(&name, args)
    }

    fn cluster_slots(&self, index: usize) -> RespValue {
        if let Some(reply) = &self.nodes[index].reported_slots {
            return reply.clone();
        }

        let node_entry = |i: usize| {
            RespValue::Array(Some(vec![
                bulk(b"127.0.0.1"),
                RespValue::Integer((BASE_PORT + i as u16) as i64),
                bulk(format!("node-{}", i).as_bytes()),
            ]))
        };

        let mut entries = Vec::new();
        let mut start = 0usize;
        while start < SLOT_COUNT {
            let owner = self.owner[start];
            let mut end = start;
            while end + 1 < SLOT_COUNT && self.owner[end + 1] == owner {
                end += 1;
            }
            let mut items = vec![
                RespValue::Integer(start as i64),
                RespValue::Integer(end as i64),
                node_entry(owner),
            ];
            for (i, node) in self.nodes.iter().enumerate() {
                if node.replica_of == Some(owner) {
                    items.push(node_entry(i));
                }
            }
            entries.push(RespValue::Array(Some(items)));
            start = end + 1;
        }
        RespValue::Array(Some(entries))
    }

    fn execute(&mut self, name: &str, args: &[Vec<u8>]) -> RespValue {
        let arg = |i: usize| args.get(i).map(|a| a.as_slice()).unwrap_or_default();
        let key = arg(1).to_vec();

        match name {
            "ECHO" => bulk(arg(1)),
            "GET" => match self.data.get(&key) {
                Some(Value::Str(v)) => bulk(v),
                Some(_) => wrongtype(),
                None => RespValue::Bulk(None),
            },
            "SET" => {
                self.data.insert(key, Value::Str(arg(2).to_vec()));
                ok()
            }
            "MGET" => RespValue::Array(Some(
                args[1..]
                    .iter()
                    .map(|k| match self.data.get(k) {
                        Some(Value::Str(v)) => bulk(v),
                        _ => RespValue::Bulk(None),
                    })
                    .collect(),
            )),
            "INCR" | "INCRBY" => {
                let by = if name == "INCR" { Some(1) } else { parse_int(arg(2)) };
                let Some(by) = by else {
                    return err("ERR value is not an integer or out of range");
                };
                let current = match self.data.get(&key) {
                    Some(Value::Str(v)) => match parse_int(v) {
                        Some(n) => n,
                        None => return err("ERR value is not an integer or out of range"),
                    },
                    Some(_) => return wrongtype(),
                    None => 0,
                };
                let next = current + by;
                self.data.insert(key, Value::Str(next.to_string().into_bytes()));
                RespValue::Integer(next)
            }
            "APPEND" => match self.data.entry(key).or_insert_with(|| Value::Str(Vec::new())) {
                Value::Str(v) => {
                    v.extend_from_slice(arg(2));
                    RespValue::Integer(v.len() as i64)
                }
                _ => wrongtype(),
            },
            "STRLEN" => match self.data.get(&key) {
                Some(Value::Str(v)) => RespValue::Integer(v.len() as i64),
                Some(_) => wrongtype(),
                None => RespValue::Integer(0),
            },
            "DEL" => {
                let removed = args[1..]
                    .iter()
                    .filter(|k| self.data.remove(*k).is_some())
                    .count();
                RespValue::Integer(removed as i64)
            }
            "EXISTS" => RespValue::Integer(
                args[1..].iter().filter(|k| self.data.contains_key(*k)).count() as i64,
            ),
            "EXPIRE" => RespValue::Integer(self.data.contains_key(&key) as i64),
            "TTL" => RespValue::Integer(if self.data.contains_key(&key) { -1 } else { -2 }),
            "TYPE" => RespValue::Status(
                match self.data.get(&key) {
                    Some(Value::Str(_)) => "string",
                    Some(Value::List(_)) => "list",
                    Some(Value::Hash(_)) => "hash",
                    None => "none",
                }
                .to_string(),
            ),
            "LPUSH" | "RPUSH" => {
                match self.data.entry(key).or_insert_with(|| Value::List(VecDeque::new())) {
                    Value::List(list) => {
                        for value in &args[2..] {
                            if name == "LPUSH" {
                                list.push_front(value.clone());
                            } else {
                                list.push_back(value.clone());
                            }
                        }
                        RespValue::Integer(list.len() as i64)
                    }
                    _ => wrongtype(),
                }
            }
            "LPOP" => self.pop_front(&key),
            "LLEN" => match self.data.get(&key) {
                Some(Value::List(list)) => RespValue::Integer(list.len() as i64),
                Some(_) => wrongtype(),
                None => RespValue::Integer(0),
            },
            "LRANGE" => match self.data.get(&key) {
                Some(Value::List(list)) => {
                    let len = list.len() as i64;
                    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
                    let start = norm(parse_int(arg(2)).unwrap_or(0));
                    let stop = norm(parse_int(arg(3)).unwrap_or(-1)).min(len - 1);
                    let items = (start..=stop)
                        .filter_map(|i| list.get(i as usize))
                        .map(|v| bulk(v))
                        .collect();
                    RespValue::Array(Some(items))
                }
                Some(_) => wrongtype(),
                None => RespValue::Array(Some(vec![])),
            },
            "BLPOP" => {
                for k in &args[1..args.len().saturating_sub(1)] {
                    if let RespValue::Bulk(Some(v)) = self.pop_front(k) {
                        return RespValue::Array(Some(vec![bulk(k), bulk(&v)]));
                    }
                }
                RespValue::Array(None)
            }
            "HSET" => match self.data.entry(key).or_insert_with(|| Value::Hash(BTreeMap::new())) {
                Value::Hash(hash) => {
                    let mut added = 0;
                    for pair in args[2..].chunks(2) {
                        if let [field, value] = pair {
                            if hash.insert(field.clone(), value.clone()).is_none() {
                                added += 1;
                            }
                        }
                    }
                    RespValue::Integer(added)
                }
                _ => wrongtype(),
            },
            "HGET" => match self.data.get(&key) {
                Some(Value::Hash(hash)) => match hash.get(arg(2)) {
                    Some(v) => bulk(v),
                    None => RespValue::Bulk(None),
                },
                Some(_) => wrongtype(),
                None => RespValue::Bulk(None),
            },
            "HGETALL" => match self.data.get(&key) {
                Some(Value::Hash(hash)) => RespValue::Array(Some(
                    hash.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect(),
                )),
                Some(_) => wrongtype(),
                None => RespValue::Array(Some(vec![])),
            },
            "HDEL" => match self.data.get_mut(&key) {
                Some(Value::Hash(hash)) => RespValue::Integer(
                    args[2..].iter().filter(|f| hash.remove(*f).is_some()).count() as i64,
                ),
                Some(_) => wrongtype(),
                None => RespValue::Integer(0),
            },
            other => err(&format!("ERR unknown command '{}'", other)),
        }
    }

    fn pop_front(&mut self, key: &[u8]) -> RespValue {
        match self.data.get_mut(key) {
            Some(Value::List(list)) => {
                let popped = list.pop_front();
                if list.is_empty() {
                    self.data.remove(key);
                }
                match popped {
                    Some(v) => RespValue::Bulk(Some(v)),
                    None => RespValue::Bulk(None),
                }
            }
            Some(_) => wrongtype(),
            None => RespValue::Bulk(None),
        }
    }
}

/// Keys a command touches, for routing checks
fn command_keys<'a>(name: &str, args: &'a [Vec<u8>]) -> Vec<&'a [u8]> {
    let all = || args[1..].iter().map(|a| a.as_slice()).collect::<Vec<_>>();
    match name {
        "MGET" | "DEL" | "EXISTS" => all(),
        "BLPOP" => args[1..args.len().saturating_sub(1).max(1)]
            .iter()
            .map(|a| a.as_slice())
            .collect(),
        "ECHO" => Vec::new(),
        _ => args.get(1).map(|a| vec![a.as_slice()]).unwrap_or_default(),
    }
}
