//! two manager hosts over one store, wired together by an in-process rpc
#![allow(dead_code)]
use std::{collections::HashMap, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use config::{ManagerOpts, QuotaLimits};
use fip_store::{Instance, Network, NewFloatingIp, Storage, memory::MemoryStore};
use floating_ips::{
    AssociateRequest, DisassociateRequest, EventType, FloatingIpError, FloatingIpManager,
    HostRpc, Notification, Notifier, RequestContext, RpcError,
};
use net_drivers::{DriverError, L3Driver, MemoryDnsDriver};
use parking_lot::{Mutex, RwLock};
use quota::MemoryQuota;
use uuid::Uuid;

pub const NET_HOST: &str = "net-1";
pub const COMPUTE_HOST: &str = "compute-2";

/// instance on the single host network
pub const WEB: Uuid = Uuid::from_u128(0x1f0c2a9e_51d4_4c6b_8e2f_3a7b9d0e4c21);
/// instance on the multi host network, running on compute-2
pub const DB: Uuid = Uuid::from_u128(0x7a3e9c14_0b2d_4f85_a6c1_d4e8f2b05937);

pub fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::from([a, b, c, d])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(IpAddr, IpAddr),
    Remove(IpAddr, IpAddr),
    Conntrack(IpAddr),
}

#[derive(Debug, Default)]
pub struct RecordingL3 {
    calls: Mutex<Vec<Call>>,
    fail: Mutex<Option<DriverError>>,
}

impl RecordingL3 {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn fail_next(&self, err: DriverError) {
        *self.fail.lock() = Some(err);
    }

    fn record(&self, call: Call) -> Result<(), DriverError> {
        if let Some(err) = self.fail.lock().take() {
            return Err(err);
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl L3Driver for RecordingL3 {
    async fn add_floating_ip(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        _interface: &str,
        _network: &Network,
    ) -> Result<(), DriverError> {
        self.record(Call::Add(floating, fixed))
    }

    async fn remove_floating_ip(
        &self,
        floating: IpAddr,
        fixed: IpAddr,
        _interface: &str,
        _network: &Network,
    ) -> Result<(), DriverError> {
        self.record(Call::Remove(floating, fixed))
    }

    async fn clean_conntrack(&self, fixed: IpAddr) -> Result<(), DriverError> {
        self.record(Call::Conntrack(fixed))
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<EventType> {
        self.sent.lock().iter().map(|n| n.event_type).collect()
    }

    pub fn publishers(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|n| n.publisher_id.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

/// Hands requests straight to the peer's manager, the way the rpc server
/// does after decoding them.
#[derive(Debug, Default)]
pub struct LoopbackRpc {
    peers: RwLock<HashMap<String, FloatingIpManager<MemoryStore>>>,
}

impl LoopbackRpc {
    pub fn register(&self, mgr: FloatingIpManager<MemoryStore>) {
        self.peers.write().insert(mgr.host().to_owned(), mgr);
    }

    fn peer(&self, host: &str) -> Result<FloatingIpManager<MemoryStore>, RpcError> {
        self.peers
            .read()
            .get(host)
            .cloned()
            .ok_or_else(|| RpcError::Unreachable {
                host: host.to_owned(),
                reason: "no responders".into(),
            })
    }
}

fn remote<E: std::error::Error>(host: &str, err: FloatingIpError<E>) -> RpcError {
    RpcError::Remote {
        host: host.to_owned(),
        kind: err.kind(),
        message: err.to_string(),
    }
}

#[async_trait]
impl HostRpc for LoopbackRpc {
    async fn associate_floating_ip(
        &self,
        ctx: &RequestContext,
        host: &str,
        req: AssociateRequest,
    ) -> Result<(), RpcError> {
        self.peer(host)?
            .associate_local(ctx, req)
            .await
            .map_err(|err| remote(host, err))
    }

    async fn disassociate_floating_ip(
        &self,
        ctx: &RequestContext,
        host: &str,
        req: DisassociateRequest,
    ) -> Result<(), RpcError> {
        self.peer(host)?
            .disassociate_local(ctx, req)
            .await
            .map_err(|err| remote(host, err))
    }
}

pub struct Node {
    pub mgr: FloatingIpManager<MemoryStore>,
    pub l3: Arc<RecordingL3>,
}

pub struct Cluster {
    pub store: MemoryStore,
    pub quota: Arc<MemoryQuota>,
    pub notifier: Arc<RecordingNotifier>,
    pub net: Node,
    pub compute: Node,
}

impl Cluster {
    pub async fn new() -> Self {
        Self::with_quota(QuotaLimits::default()).await
    }

    pub async fn with_quota(limits: QuotaLimits) -> Self {
        let store = seeded_store().await;
        let quota = Arc::new(MemoryQuota::new(limits));
        let notifier = Arc::new(RecordingNotifier::default());
        let rpc = Arc::new(LoopbackRpc::default());

        let node = |host: &str| {
            let l3 = Arc::new(RecordingL3::default());
            let mgr = FloatingIpManager::new(
                host,
                store.clone(),
                ManagerOpts::default(),
                quota.clone(),
                l3.clone(),
                Arc::new(MemoryDnsDriver::new()),
                Arc::new(MemoryDnsDriver::new()),
            )
            .with_rpc(rpc.clone())
            .with_notifier(notifier.clone());
            rpc.register(mgr.clone());
            Node { mgr, l3 }
        };
        let net = node(NET_HOST);
        let compute = node(COMPUTE_HOST);
        Self {
            store,
            quota,
            notifier,
            net,
            compute,
        }
    }

    /// heartbeat both hosts' network services
    pub async fn all_up(&self) {
        for host in [NET_HOST, COMPUTE_HOST] {
            self.store.service_heartbeat(host, "network").await.unwrap();
        }
    }
}

async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .floating_ip_bulk_create(
            (1..=3)
                .map(|d| NewFloatingIp {
                    address: ip(203, 0, 113, d),
                    pool: "public".into(),
                    interface: None,
                })
                .collect(),
        )
        .await
        .unwrap();
    store.add_network(Network {
        id: 1,
        label: "web".into(),
        multi_host: false,
        host: Some(NET_HOST.into()),
    });
    store.add_network(Network {
        id: 2,
        label: "db".into(),
        multi_host: true,
        host: None,
    });
    store.add_instance(Instance {
        uuid: WEB,
        host: Some(NET_HOST.into()),
        project_id: "p1".into(),
    });
    store.add_instance(Instance {
        uuid: DB,
        host: Some(COMPUTE_HOST.into()),
        project_id: "p1".into(),
    });
    store.add_fixed_ip(ip(10, 0, 0, 5), 1, Some(WEB)).unwrap();
    store.add_fixed_ip(ip(10, 1, 0, 5), 2, Some(DB)).unwrap();
    store
}
