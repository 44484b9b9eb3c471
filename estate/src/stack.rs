//! The stack: coordinator owning the socket, the four service deques,
//! the remote registry, the transaction table, and the statistics
//! counters (spec §2 "Stack", §4.5 "Service loop").

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::Value;

use crate::crypto::{Boxer, KeyFactory, KeyMaterial, Signer};
use crate::error::{Error, Result};
use crate::estate::Estate;
use crate::keep::{
    self, Acceptance, FileKeepStore, MemoryKeepStore, PlainKeep, PlainLocalData, PlainRemoteData,
    SafeKeep, SafeLocalData, SafeRemoteData,
};
use crate::packet::{BodyKind, CoatKind, FootKind, Header, Packet, PacketBuilder, PacketKind, TransactionKind};
use crate::registry::Registry;
use crate::socket::{HostAddr, Socket};
use crate::stats::Stats;
use crate::transaction::{
    self, Inbound, PeerKey, Role, TxData, TxHeader, TxIndex, TxOutcome, Transaction,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

enum KeepBackend {
    Memory(PlainKeep<MemoryKeepStore>, SafeKeep<MemoryKeepStore>),
    File(PlainKeep<FileKeepStore>, SafeKeep<FileKeepStore>),
}

impl KeepBackend {
    fn load_local(&self) -> Option<(PlainLocalData, SafeLocalData)> {
        let (keep_data, safe_data) = match self {
            KeepBackend::Memory(p, s) => (p.load_local_data(), s.load_local_data()),
            KeepBackend::File(p, s) => (p.load_local_data(), s.load_local_data()),
        };
        let keep_data = keep_data?;
        let safe_data = safe_data?;
        let ok = match self {
            KeepBackend::Memory(p, s) => p.verify_local_data(&keep_data) && s.verify_local_data(&safe_data),
            KeepBackend::File(p, s) => p.verify_local_data(&keep_data) && s.verify_local_data(&safe_data),
        };
        ok.then_some((keep_data, safe_data))
    }

    fn load_remotes(&self) -> Vec<(PlainRemoteData, SafeRemoteData)> {
        let (keeps, safes) = match self {
            KeepBackend::Memory(p, s) => (p.load_all_remote_data(), s.load_all_remote_data()),
            KeepBackend::File(p, s) => (p.load_all_remote_data(), s.load_all_remote_data()),
        };
        let mut out = Vec::new();
        for (uid, keep_data) in keeps {
            let Some(safe_data) = safes.get(&uid).cloned() else {
                continue;
            };
            let ok = match self {
                KeepBackend::Memory(p, s) => p.verify_remote_data(&keep_data) && s.verify_remote_data(&safe_data),
                KeepBackend::File(p, s) => p.verify_remote_data(&keep_data) && s.verify_remote_data(&safe_data),
            };
            if ok {
                out.push((keep_data, safe_data));
            }
        }
        out
    }

    fn dump_local(&mut self, keep_data: &PlainLocalData, safe_data: &SafeLocalData) {
        match self {
            KeepBackend::Memory(p, s) => {
                p.dump_local(keep_data);
                s.dump_local(safe_data);
            }
            KeepBackend::File(p, s) => {
                p.dump_local(keep_data);
                s.dump_local(safe_data);
            }
        }
    }

    fn dump_remote(&mut self, keep_data: &PlainRemoteData, safe_data: &SafeRemoteData) {
        match self {
            KeepBackend::Memory(p, s) => {
                p.dump_remote(keep_data);
                s.dump_remote(keep_data.uid, safe_data);
            }
            KeepBackend::File(p, s) => {
                p.dump_remote(keep_data);
                s.dump_remote(keep_data.uid, safe_data);
            }
        }
    }

    fn clear_remote(&mut self, uid: u32) {
        match self {
            KeepBackend::Memory(p, s) => {
                p.clear_remote_data(uid);
                s.clear_remote(uid);
            }
            KeepBackend::File(p, s) => {
                p.clear_remote_data(uid);
                s.clear_remote(uid);
            }
        }
    }

    fn clear_local(&mut self) {
        match self {
            KeepBackend::Memory(p, s) => {
                p.clear_local_data();
                s.clear_local_data();
            }
            KeepBackend::File(p, s) => {
                p.clear_local_data();
                s.clear_local_data();
            }
        }
    }
}

/// Builder for [`Stack`], mirroring the teacher crate's endpoint builder:
/// a consuming `with_*` chain finished by [`Builder::build`].
pub struct Builder<S, K, F> {
    name: String,
    main: bool,
    dirpath: Option<PathBuf>,
    local_name: String,
    eid: u32,
    ha: Option<HostAddr>,
    bufcnt: usize,
    period: Duration,
    offset: Duration,
    auto: bool,
    clean: bool,
    socket: Option<S>,
    local_keys: Option<K>,
    key_factory: Option<F>,
}

impl<S: Socket, K: KeyMaterial, F: KeyFactory> Default for Builder<S, K, F> {
    fn default() -> Self {
        Self {
            name: String::new(),
            main: false,
            dirpath: None,
            local_name: String::new(),
            eid: 0,
            ha: None,
            bufcnt: 2,
            period: Duration::from_secs(1),
            offset: Duration::from_millis(500),
            auto: false,
            clean: false,
            socket: None,
            local_keys: None,
            key_factory: None,
        }
    }
}

impl<S: Socket, K: KeyMaterial, F: KeyFactory> Builder<S, K, F> {
    /// Sets the stack name.
    pub fn with_name<T: AsRef<str>>(mut self, name: T) -> Self {
        self.name = name.as_ref().to_string();
        self
    }

    /// Marks the local estate as the rendezvous (`main`) role.
    pub fn with_main(mut self, main: bool) -> Self {
        self.main = main;
        self
    }

    /// Roots keep persistence under `dirpath` (file backed); without this
    /// call the stack uses an in-memory keep.
    pub fn with_dirpath(mut self, dirpath: impl Into<PathBuf>) -> Self {
        self.dirpath = Some(dirpath.into());
        self
    }

    /// Sets the local estate's name.
    pub fn with_local_name<T: AsRef<str>>(mut self, name: T) -> Self {
        self.local_name = name.as_ref().to_string();
        self
    }

    /// Sets the local estate's uid.
    pub fn with_eid(mut self, eid: u32) -> Self {
        self.eid = eid;
        self
    }

    /// Sets the local bind address.
    pub fn with_ha(mut self, ha: HostAddr) -> Self {
        self.ha = Some(ha);
        self
    }

    /// Sets receive-buffer sizing, in units of one UDP max packet.
    pub fn with_bufcnt(mut self, bufcnt: usize) -> Self {
        self.bufcnt = bufcnt;
        self
    }

    /// Sets the keep-alive cadence.
    pub fn with_period(mut self, period: Duration, offset: Duration) -> Self {
        self.period = period;
        self.offset = offset;
        self
    }

    /// Sets the default acceptance policy for newly seen remotes.
    pub fn with_auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }

    /// Wipes persisted keeps before loading.
    pub fn with_clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    /// Supplies the non-blocking socket the stack will drive.
    pub fn with_socket(mut self, socket: S) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Supplies the local identity keypair.
    pub fn with_local_keys(mut self, keys: K) -> Self {
        self.local_keys = Some(keys);
        self
    }

    /// Supplies the factory used to reconstruct remote verify keys.
    pub fn with_key_factory(mut self, factory: F) -> Self {
        self.key_factory = Some(factory);
        self
    }

    /// Builds the stack: loads (or creates) the local estate, loads
    /// remotes, reopens the socket, and dumps the local/remote state back
    /// to the keep.
    pub fn build(self) -> Result<Stack<S, K, F>> {
        let socket = self
            .socket
            .ok_or_else(|| Error::Stack("stack requires a socket".into()))?;
        let local_keys = self
            .local_keys
            .ok_or_else(|| Error::Stack("stack requires local key material".into()))?;
        let key_factory = self
            .key_factory
            .ok_or_else(|| Error::Stack("stack requires a key factory".into()))?;

        let mut keep_backend = match self.dirpath {
            Some(dir) => {
                let (p, s) = keep::open_file_keeps(&dir)?;
                KeepBackend::File(p, s)
            }
            None => KeepBackend::Memory(
                PlainKeep::new(MemoryKeepStore::new()),
                SafeKeep::new(MemoryKeepStore::new()),
            ),
        };

        if self.clean {
            keep_backend.clear_local();
        }

        let default_ha = self.ha.unwrap_or_else(|| {
            let port = if self.main { 7530 } else { 7531 };
            format!("127.0.0.1:{port}").parse().expect("valid loopback addr")
        });

        // ADDED (spec §9 "asymmetric name-capture", preserved): the
        // stack's own `name` is only overwritten by the loaded estate's
        // name when a valid keep is actually found; every fallback
        // branch below leaves it as the caller constructed it.
        let mut loaded_name = None;
        let (mut local, neid) = match keep_backend.load_local() {
            Some((keep_data, safe_data)) => {
                loaded_name = Some(keep_data.name.clone());
                let mut local = Estate::new(keep_data.name, keep_data.ha);
                local.uid = keep_data.uid;
                local.sid = keep_data.sid;
                local.main = keep_data.main;
                local.sighex = safe_data.sighex;
                local.prihex = safe_data.prihex;
                local.auto = safe_data.auto;
                local.acceptance = Acceptance::Accepted;
                (local, keep_data.neid)
            }
            None => {
                let mut local = Estate::new(self.local_name, default_ha);
                local.uid = self.eid;
                local.main = self.main;
                local.sighex = local_keys.verify_key_hex();
                local.prihex = local_keys.public_key_hex();
                local.auto = self.auto;
                local.acceptance = Acceptance::Accepted;
                (local, 1)
            }
        };
        local.ha = socket.local_addr();

        let mut registry = Registry::new();
        for (keep_data, safe_data) in keep_backend.load_remotes() {
            let mut remote = Estate::new(keep_data.name, keep_data.ha);
            remote.uid = keep_data.uid;
            remote.sid = keep_data.sid;
            remote.acceptance = safe_data.acceptance;
            remote.sighex = safe_data.verhex;
            remote.prihex = safe_data.pubhex;
            remote.next_sid();
            // ADDED (spec §4.3): the original `loadRemotes` bug referenced
            // an undefined name instead of this constructed remote; we
            // add the remote we just built.
            registry.add_remote(remote, None, local.uid, &local.name)?;
        }

        let mut socket = socket;
        if !socket.reopen() {
            return Err(Error::Stack(format!(
                "stack '{}': failed opening socket at '{:?}'",
                self.name, local.ha
            )));
        }

        let name = loaded_name.unwrap_or_else(|| {
            if self.name.is_empty() {
                format!("stack{neid}")
            } else {
                self.name
            }
        });

        let mut stack = Stack {
            name,
            local,
            local_keys,
            key_factory,
            registry,
            transactions: IndexMap::new(),
            rxes: VecDeque::new(),
            rx_msgs: VecDeque::new(),
            tx_msgs: VecDeque::new(),
            txes: VecDeque::new(),
            stats: Stats::new(),
            socket,
            neid,
            bufcnt: self.bufcnt,
            period: self.period,
            offset: self.offset,
            auto: self.auto,
            next_tid: 1,
            keep: keep_backend,
        };
        stack.dump_local();
        stack.dump_remotes();
        Ok(stack)
    }
}

/// The protocol coordinator: owns the socket, the four service deques,
/// the remote registry, the transaction table, and the statistics
/// counters (spec §2).
pub struct Stack<S, K, F> {
    name: String,
    local: Estate,
    local_keys: K,
    key_factory: F,
    registry: Registry,
    transactions: IndexMap<TxIndex, Transaction>,
    rxes: VecDeque<(Vec<u8>, HostAddr)>,
    rx_msgs: VecDeque<Value>,
    tx_msgs: VecDeque<(Value, Option<u32>)>,
    txes: VecDeque<(Bytes, HostAddr)>,
    stats: Stats,
    socket: S,
    neid: u32,
    bufcnt: usize,
    period: Duration,
    offset: Duration,
    auto: bool,
    next_tid: u32,
    keep: KeepBackend,
}

impl<S: Socket, K: KeyMaterial, F: KeyFactory> Stack<S, K, F> {
    /// Starts building a stack.
    pub fn builder() -> Builder<S, K, F> {
        Builder::default()
    }

    /// The stack's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local estate.
    pub fn local(&self) -> &Estate {
        &self.local
    }

    /// Read-only access to the remote registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Read-only access to the statistics counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Increments a stat counter.
    pub fn inc_stat(&mut self, key: &str) {
        self.stats.inc(key);
    }

    /// Sets a stat counter to an absolute value.
    pub fn update_stat(&mut self, key: &str, value: i64) {
        self.stats.update(key, value);
    }

    /// Zeroes a single stat counter.
    pub fn clear_stat(&mut self, key: &str) {
        self.stats.clear(key);
    }

    /// Zeroes every stat counter.
    pub fn clear_stats(&mut self) {
        self.stats.clear_all();
    }

    /// Drains every application message delivered since the last call.
    pub fn take_messages(&mut self) -> Vec<Value> {
        self.rx_msgs.drain(..).collect()
    }

    fn next_eid(&mut self) -> u32 {
        self.neid = self.neid.wrapping_add(1);
        if self.neid == 0 {
            self.neid = 1;
        }
        self.neid
    }

    fn next_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn dump_local(&mut self) {
        let keep_data = PlainLocalData {
            uid: self.local.uid,
            name: self.local.name.clone(),
            stack: self.name.clone(),
            main: self.local.main,
            ha: self.local.ha,
            sid: self.local.sid,
            neid: self.neid,
        };
        let safe_data = SafeLocalData {
            sighex: self.local.sighex.clone(),
            prihex: self.local.prihex.clone(),
            auto: self.local.auto,
        };
        self.keep.dump_local(&keep_data, &safe_data);
    }

    fn dump_remote_estate(&mut self, uid: u32) {
        let Some(remote) = self.registry.get(uid) else {
            return;
        };
        let keep_data = PlainRemoteData {
            uid: remote.uid,
            name: remote.name.clone(),
            ha: remote.ha,
            sid: remote.sid,
        };
        let safe_data = SafeRemoteData {
            verhex: remote.sighex.clone(),
            pubhex: remote.prihex.clone(),
            acceptance: remote.acceptance,
        };
        self.keep.dump_remote(&keep_data, &safe_data);
    }

    fn dump_remotes(&mut self) {
        let uids: Vec<u32> = self.registry.iter().map(|(uid, _)| *uid).collect();
        for uid in uids {
            self.dump_remote_estate(uid);
        }
    }

    /// Adds `remote` to the registry, persisting it to the keep.
    pub fn add_remote(&mut self, remote: Estate, uid: Option<u32>) -> Result<u32> {
        let uid = self
            .registry
            .add_remote(remote, uid, self.local.uid, &self.local.name)?;
        self.dump_remote_estate(uid);
        Ok(uid)
    }

    /// Removes the remote at `uid`, nacking and discarding every
    /// transaction bound to it (spec §4.2).
    pub fn remove_remote(&mut self, uid: u32) -> Result<()> {
        let remote = self.registry.remove_remote(uid)?;
        for index in remote.indexes {
            if let Some(mut tx) = self.transactions.shift_remove(&index) {
                let _ = tx.cancel();
            }
        }
        self.keep.clear_remote(uid);
        Ok(())
    }

    /// Resolves an outbound target: returns `duid` if known, otherwise
    /// synthesises a remote at `ha` (or a default loopback address) and
    /// adds it, mirroring `retrieveRemote` (spec §4.2).
    pub fn retrieve_remote(&mut self, duid: Option<u32>, ha: Option<HostAddr>) -> Result<u32> {
        if let Some(duid) = duid {
            return if self.registry.get(duid).is_some() {
                Ok(duid)
            } else {
                self.stats.inc("invalid_remote_eid");
                Err(Error::InvalidRemoteEid(Some(duid)))
            };
        }
        if let Some(first) = self.registry.first() {
            return Ok(first.uid);
        }
        let port = if self.local.main { 7530 } else { 7531 };
        let default_ha: HostAddr = ha.unwrap_or_else(|| format!("127.0.0.1:{port}").parse().unwrap());
        let eid = self.next_eid();
        let mut remote = Estate::new(format!("remote{eid}"), default_ha);
        remote.uid = eid;
        let uid = self.add_remote(remote, Some(eid))?;
        Ok(uid)
    }

    fn add_transaction(&mut self, tx: Transaction) {
        let index = tx.index();
        log::trace!("Transaction Created [{:?} {:?}] tid={}", index.kind, index.role, index.tid);
        if let PeerKey::Uid(uid) = index.peer_key {
            if let Some(remote) = self.registry.get_mut(uid) {
                remote.indexes.insert(index);
            }
        }
        self.transactions.insert(index, tx);
    }

    fn remove_transaction(&mut self, index: TxIndex) {
        if self.transactions.shift_remove(&index).is_some() {
            log::trace!("Transaction Removed [{:?} {:?}] tid={}", index.kind, index.role, index.tid);
            if let PeerKey::Uid(uid) = index.peer_key {
                if let Some(remote) = self.registry.get_mut(uid) {
                    remote.indexes.remove(&index);
                }
            }
        }
    }

    fn apply_outcomes(&mut self, index: TxIndex, remote_uid: u32, outcomes: Vec<TxOutcome>) {
        for outcome in outcomes {
            match outcome {
                TxOutcome::Send { pk, body } => {
                    if let Some(tx) = self.transactions.get(&index) {
                        let header = tx.header().clone();
                        let role = tx.role();
                        let kind = tx.kind();
                        let _ = self.send_packet(remote_uid, role, kind, header.tid, header.sid, header.tx_data, pk, body);
                    }
                }
                TxOutcome::Deliver(body) => self.rx_msgs.push_back(body),
                TxOutcome::Done | TxOutcome::Failed => {
                    self.remove_transaction(index);
                }
            }
        }
    }

    fn send_packet(
        &mut self,
        remote_uid: u32,
        role: Role,
        kind: TransactionKind,
        tid: u32,
        sid: u32,
        tx_data: TxData,
        pk: PacketKind,
        body: Option<Value>,
    ) -> Result<()> {
        let Some(remote) = self.registry.get(remote_uid) else {
            return Err(Error::InvalidRemoteEid(Some(remote_uid)));
        };
        let header = Header {
            se: self.local.uid,
            de: remote.uid,
            si: sid,
            ti: tid,
            tk: kind,
            pk,
            cf: role == Role::Correspondent,
            bf: false,
            hk: tx_data.hk,
            bk: tx_data.bk,
            fk: tx_data.fk,
            ck: tx_data.ck,
        };
        let encoded = match body {
            Some(v) => PacketBuilder::encode_body(tx_data.bk, &v)?,
            None => Vec::new(),
        };
        let builder = PacketBuilder::new(header);
        let remote_pub_hex = remote.prihex.clone();
        let remote_ha = remote.ha;
        let signer: Option<&dyn Signer> = match tx_data.fk {
            FootKind::None => None,
            FootKind::NaclSig => Some(&self.local_keys),
        };
        let boxer: Option<(&dyn Boxer, &str)> = match tx_data.ck {
            CoatKind::None => None,
            CoatKind::NaclBox => Some((&self.local_keys, remote_pub_hex.as_str())),
        };
        let wire = builder.pack(&encoded, signer, boxer)?;
        log::debug!("=> {:?} {:?} to /{} si={} ti={}", kind, pk, remote_ha, sid, tid);
        self.txes.push_back((wire, remote_ha));
        Ok(())
    }

    // ---- initiation ----

    /// Initiates a join transaction with `duid` (or a bootstrapped remote
    /// at `ha`).
    pub fn join(&mut self, duid: Option<u32>, ha: Option<HostAddr>, cascade: bool) -> Result<()> {
        let remote_uid = self.retrieve_remote(duid, ha)?;
        let tid = self.next_tid();
        let header = TxHeader::new(tid, 0, remote_uid, TxData::for_join(), Instant::now(), DEFAULT_TIMEOUT);
        let mut tx = Transaction::Joiner(transaction::Joiner::new(header, cascade));
        let outcomes = tx.process(Instant::now());
        let index = tx.index();
        self.add_transaction(tx);
        self.apply_outcomes(index, remote_uid, outcomes);
        Ok(())
    }

    /// Initiates an allow transaction with `duid`.
    pub fn allow(&mut self, duid: Option<u32>, ha: Option<HostAddr>, cascade: bool) -> Result<()> {
        let remote_uid = self.retrieve_remote(duid, ha)?;
        let sid = self.next_remote_sid(remote_uid);
        let tid = self.next_tid();
        let header = TxHeader::new(tid, sid, remote_uid, TxData::for_allow(), Instant::now(), DEFAULT_TIMEOUT);
        let mut tx = Transaction::Allower(transaction::Allower::new(header, cascade));
        let outcomes = tx.process(Instant::now());
        let index = tx.index();
        self.add_transaction(tx);
        self.apply_outcomes(index, remote_uid, outcomes);
        Ok(())
    }

    /// Initiates an alive probe with `duid`.
    pub fn alive(&mut self, duid: Option<u32>, ha: Option<HostAddr>, cascade: bool) -> Result<()> {
        let remote_uid = self.retrieve_remote(duid, ha)?;
        let sid = self.next_remote_sid(remote_uid);
        let tid = self.next_tid();
        let header = TxHeader::new(tid, sid, remote_uid, TxData::for_secured(), Instant::now(), DEFAULT_TIMEOUT);
        let mut tx = Transaction::Aliver(transaction::Aliver::new(header, cascade));
        let outcomes = tx.process(Instant::now());
        let index = tx.index();
        self.add_transaction(tx);
        self.apply_outcomes(index, remote_uid, outcomes);
        Ok(())
    }

    /// Sends an application message to `duid`.
    pub fn message(&mut self, body: Value, duid: Option<u32>, ha: Option<HostAddr>, wait: bool) -> Result<()> {
        transaction::validate_body(&body)?;
        let remote_uid = self.retrieve_remote(duid, ha)?;
        let sid = self.next_remote_sid(remote_uid);
        let tid = self.next_tid();
        let header = TxHeader::new(tid, sid, remote_uid, TxData::for_secured(), Instant::now(), DEFAULT_TIMEOUT);
        let mut tx = Transaction::Messenger(transaction::Messenger::new(header, body, false, wait));
        let outcomes = tx.process(Instant::now());
        let index = tx.index();
        self.add_transaction(tx);
        self.apply_outcomes(index, remote_uid, outcomes);
        Ok(())
    }

    fn next_remote_sid(&mut self, remote_uid: u32) -> u32 {
        self.registry
            .get_mut(remote_uid)
            .map(|r| r.next_sid())
            .unwrap_or(1)
    }

    /// Enqueues `body` for transmission to `duid` (or the first remote if
    /// `duid` is `None`), rejecting non-mapping bodies at enqueue time
    /// (spec §4.5 `transmit`).
    pub fn transmit(&mut self, body: Value, duid: Option<u32>) -> Result<()> {
        if transaction::validate_body(&body).is_err() {
            self.stats.inc("invalid_transmit_body");
            return Err(Error::InvalidTransmitBody);
        }
        let duid = match duid {
            Some(d) => Some(d),
            None => {
                if self.registry.is_empty() {
                    self.stats.inc("invalid_destination");
                    return Err(Error::InvalidDestination(0));
                }
                self.registry.first().map(|r| r.uid)
            }
        };
        self.tx_msgs.push_back((body, duid));
        Ok(())
    }

    // ---- inbound dispatch ----

    fn stale(&mut self, remote_uid: u32, sid: u32, tid: u32) {
        let header = TxHeader::new(tid, sid, remote_uid, TxData::for_join(), Instant::now(), DEFAULT_TIMEOUT);
        let mut tx = Transaction::Staler(transaction::Staler::new(header));
        let outcomes = tx.process(Instant::now());
        self.apply_staler_outcomes(remote_uid, sid, tid, outcomes);
    }

    fn apply_staler_outcomes(&mut self, remote_uid: u32, sid: u32, tid: u32, outcomes: Vec<TxOutcome>) {
        for outcome in outcomes {
            if let TxOutcome::Send { pk, body } = outcome {
                let _ = self.send_packet(
                    remote_uid,
                    Role::Correspondent,
                    TransactionKind::Stale,
                    tid,
                    sid,
                    TxData::for_join(),
                    pk,
                    body,
                );
            }
        }
    }

    fn reply(&mut self, header: &Header, source_ha: HostAddr, remote_uid: Option<u32>) -> Result<()> {
        if header.tk == TransactionKind::Join && header.pk == PacketKind::Request && header.si == 0 {
            let mut remote = Estate::new(format!("remote{}", self.next_eid()), source_ha);
            remote.acceptance = if self.auto { Acceptance::Accepted } else { Acceptance::Pending };
            let uid = self.add_remote(remote, None)?;
            let tx_header = TxHeader::new(header.ti, header.si, uid, TxData::for_join(), Instant::now(), DEFAULT_TIMEOUT);
            let mut tx = Transaction::Joinent(transaction::Joinent::new(tx_header));
            let outcomes = tx.process(Instant::now());
            let index = tx.index();
            self.add_transaction(tx);
            self.apply_outcomes(index, uid, outcomes);
            return Ok(());
        }

        let Some(remote_uid) = remote_uid else {
            // ADDED (spec §9): the original `reply()` called
            // `self.stack.incStat`/`self.remove()` as if `self` were a
            // transaction, though `reply` is a Stack method with no
            // transaction to remove. Treated as stack-only: count the
            // stat and stop.
            log::warn!("dropping {:?} {:?} from unknown eid", header.tk, header.pk);
            self.stats.inc("invalid_remote_eid");
            return Ok(());
        };

        if header.tk == TransactionKind::Allow && header.pk == PacketKind::Hello && header.si != 0 {
            let tx_header = TxHeader::new(header.ti, header.si, remote_uid, TxData::for_allow(), Instant::now(), DEFAULT_TIMEOUT);
            let mut tx = Transaction::Allowent(transaction::Allowent::new(tx_header));
            let outcomes = tx.process(Instant::now());
            let index = tx.index();
            self.add_transaction(tx);
            self.apply_outcomes(index, remote_uid, outcomes);
            return Ok(());
        }

        if header.tk == TransactionKind::Alive && header.pk == PacketKind::Request && header.si != 0 {
            let tx_header = TxHeader::new(header.ti, header.si, remote_uid, TxData::for_secured(), Instant::now(), DEFAULT_TIMEOUT);
            let mut tx = Transaction::Alivent(transaction::Alivent::new(tx_header, header.bf));
            let outcomes = tx.process(Instant::now());
            let index = tx.index();
            self.add_transaction(tx);
            self.apply_outcomes(index, remote_uid, outcomes);
            return Ok(());
        }

        if header.tk == TransactionKind::Message && header.pk == PacketKind::Message && header.si != 0 {
            let tx_header = TxHeader::new(header.ti, header.si, remote_uid, TxData::for_secured(), Instant::now(), DEFAULT_TIMEOUT);
            let mut tx = Transaction::Messengent(transaction::Messengent::new(tx_header, header.bf));
            let outcomes = tx.process(Instant::now());
            let index = tx.index();
            self.add_transaction(tx);
            self.apply_outcomes(index, remote_uid, outcomes);
            return Ok(());
        }

        log::warn!("stale {:?} {:?} si={} from eid {}", header.tk, header.pk, header.si, remote_uid);
        self.stats.inc("stale_packet");
        Ok(())
    }

    fn process_rx(&mut self, packet: Packet, source_ha: HostAddr) -> Result<()> {
        let header = packet.header;
        if header.de != 0 && self.local.uid != 0 && header.de != self.local.uid {
            log::warn!("dropping packet addressed to eid {} (we are {})", header.de, self.local.uid);
            self.stats.inc("invalid_destination");
            return Err(Error::InvalidDestination(header.de));
        }

        let cf = header.cf;
        let rsid = header.si;
        let remote_uid = if header.se != 0 { Some(header.se) } else { None };

        if rsid == 0 {
            if header.tk != TransactionKind::Join {
                log::warn!("dropping non-join packet with si=0 from eid {:?}", remote_uid);
                self.stats.inc("invalid_sid_attempt");
                return Err(Error::InvalidSidAttempt);
            }
        } else if let Some(remote_uid) = remote_uid {
            if !cf {
                let valid = self.registry.get(remote_uid).map(|r| r.valid_rsid(rsid));
                match valid {
                    Some(true) => {
                        if let Some(r) = self.registry.get_mut(remote_uid) {
                            if rsid > r.rsid {
                                r.rsid = rsid;
                            }
                        }
                    }
                    Some(false) => {
                        log::warn!("dropping stale sid {} from eid {}", rsid, remote_uid);
                        self.stats.inc("stale_sid_attempt");
                        return Err(Error::StaleSidAttempt);
                    }
                    None => {}
                }
            }
        }

        let mut packet = packet;
        let remote = remote_uid.and_then(|uid| self.registry.get(uid));
        let verifier = match (header.fk, remote) {
            (FootKind::NaclSig, Some(r)) => Some(self.key_factory.verifier_for_hex(&r.sighex)),
            _ => None,
        };
        let remote_pub_hex = remote.map(|r| r.prihex.clone());
        let boxer: Option<(&dyn Boxer, &str)> = match (header.ck, &remote_pub_hex) {
            (CoatKind::NaclBox, Some(hex)) => Some((&self.local_keys, hex.as_str())),
            _ => None,
        };
        packet.parse_inner(verifier.as_deref(), boxer)?;

        let peer_key = match remote_uid {
            Some(uid) => PeerKey::Uid(uid),
            None => PeerKey::Addr(source_ha),
        };
        let index = packet.index(peer_key);

        log::debug!("<= {:?} {:?} from /{} si={} ti={}", header.tk, header.pk, source_ha, header.si, header.ti);

        if self.transactions.contains_key(&index) {
            let body = if matches!(header.bk, BodyKind::Json | BodyKind::Msgpack) {
                packet.body_as::<Value>().ok()
            } else {
                None
            };
            let inbound = Inbound {
                pk: header.pk,
                si: header.si,
                bf: header.bf,
                body,
            };
            let outcomes = {
                let tx = self.transactions.get_mut(&index).expect("checked above");
                tx.receive(inbound)
            };
            let resolved_uid = match peer_key {
                PeerKey::Uid(uid) => uid,
                PeerKey::Addr(_) => remote_uid.unwrap_or(0),
            };
            self.apply_outcomes(index, resolved_uid, outcomes);
            return Ok(());
        }

        if cf {
            self.stale(remote_uid.unwrap_or(0), header.si, header.ti);
            return Ok(());
        }

        self.reply(&header, source_ha, remote_uid)
    }

    /// Runs a single timer tick over every open transaction (spec §4.4
    /// `process`).
    pub fn process(&mut self) {
        let now = Instant::now();
        let indexes: Vec<TxIndex> = self.transactions.keys().copied().collect();
        for index in indexes {
            let outcomes = {
                let Some(tx) = self.transactions.get_mut(&index) else {
                    continue;
                };
                tx.process(now)
            };
            let remote_uid = match index.peer_key {
                PeerKey::Uid(uid) => uid,
                PeerKey::Addr(_) => 0,
            };
            self.apply_outcomes(index, remote_uid, outcomes);
        }
    }

    /// Per-remote timer step, spec §4.4 `manage`.
    pub fn manage(&mut self, cascade: bool, immediate: bool) {
        let now = Instant::now();
        let due: Vec<u32> = self
            .registry
            .iter_mut()
            .filter(|(_, r)| r.manage(now, immediate))
            .map(|(uid, _)| *uid)
            .collect();
        for uid in due {
            let _ = self.alive(Some(uid), None, cascade);
        }
    }

    // ---- service loop ----

    fn handle_one_received(&mut self) -> bool {
        match self.socket.receive() {
            Some((buf, from)) => {
                self.rxes.push_back((buf, from));
                true
            }
            None => false,
        }
    }

    /// Drains every pending datagram from the socket into `rxes`.
    pub fn service_receives(&mut self) {
        while self.handle_one_received() {}
    }

    /// Pulls at most one pending datagram from the socket into `rxes`.
    pub fn service_receive_once(&mut self) {
        self.handle_one_received();
    }

    fn handle_one_rx(&mut self) {
        let Some((raw, from)) = self.rxes.pop_front() else {
            return;
        };
        let packet = match Packet::parse_outer(Bytes::from(raw)) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("dropping malformed packet from /{}: {}", from, e);
                if let Some(stat) = e.stat_name() {
                    self.stats.inc(stat);
                }
                return;
            }
        };
        if let Err(e) = self.process_rx(packet, from) {
            log::warn!("dropping packet from /{}: {}", from, e);
            if let Some(stat) = e.stat_name() {
                self.stats.inc(stat);
            }
        }
    }

    /// Processes every packet currently queued in `rxes`.
    pub fn service_rxes(&mut self) {
        while !self.rxes.is_empty() {
            self.handle_one_rx();
        }
    }

    /// Processes at most one packet queued in `rxes`.
    pub fn service_rx_once(&mut self) {
        if !self.rxes.is_empty() {
            self.handle_one_rx();
        }
    }

    fn handle_one_tx_msg(&mut self) {
        let Some((body, duid)) = self.tx_msgs.pop_front() else {
            return;
        };
        let _ = self.message(body, duid, None, false);
    }

    /// Spawns a Messenger for every body queued in `tx_msgs`.
    pub fn service_tx_msgs(&mut self) {
        while !self.tx_msgs.is_empty() {
            self.handle_one_tx_msg();
        }
    }

    /// Spawns a Messenger for at most one body queued in `tx_msgs`.
    pub fn service_tx_msg_once(&mut self) {
        if !self.tx_msgs.is_empty() {
            self.handle_one_tx_msg();
        }
    }

    fn handle_one_tx(&mut self, laters: &mut VecDeque<(Bytes, HostAddr)>, blocks: &mut Vec<HostAddr>) {
        let Some((tx, ta)) = self.txes.pop_front() else {
            return;
        };
        if blocks.contains(&ta) {
            laters.push_back((tx, ta));
            return;
        }
        match self.socket.send(&tx, &ta) {
            Ok(_) => {}
            Err(Error::WouldBlock) => {
                laters.push_back((tx, ta));
                blocks.push(ta);
            }
            Err(_) => {
                // Fatal socket errors are swallowed here (spec §7: only
                // `StackError` propagates out of the service loop); the
                // packet is dropped rather than retried forever.
            }
        }
    }

    /// Drains `txes` through the socket, preserving per-destination order
    /// across `WouldBlock` backpressure (spec §4.5).
    pub fn service_txes(&mut self) {
        let mut laters = VecDeque::new();
        let mut blocks = Vec::new();
        while !self.txes.is_empty() {
            self.handle_one_tx(&mut laters, &mut blocks);
        }
        while let Some(entry) = laters.pop_front() {
            self.txes.push_back(entry);
        }
    }

    /// Sends at most one queued packet through the socket.
    pub fn service_tx_once(&mut self) {
        let mut laters = VecDeque::new();
        let mut blocks = Vec::new();
        if !self.txes.is_empty() {
            self.handle_one_tx(&mut laters, &mut blocks);
        }
        while let Some(entry) = laters.pop_front() {
            self.txes.push_back(entry);
        }
    }

    /// Services the receive side: socket receive, `rxes`, then timer
    /// processing.
    pub fn service_all_rx(&mut self) {
        self.service_receives();
        self.service_rxes();
        self.process();
    }

    /// Services the transmit side: `tx_msgs`, then `txes`.
    pub fn service_all_tx(&mut self) {
        self.service_tx_msgs();
        self.service_txes();
    }

    /// Runs a full service cycle: receive side then transmit side.
    pub fn service_all(&mut self) {
        self.service_all_rx();
        self.service_all_tx();
    }

    /// Propagates one packet all the way through the receive side.
    pub fn service_one_all_rx(&mut self) {
        self.service_receive_once();
        self.service_rx_once();
        self.process();
    }

    /// Propagates one message all the way through the transmit side.
    pub fn service_one_all_tx(&mut self) {
        self.service_tx_msg_once();
        self.service_tx_once();
    }
}
