//! In-memory kernel and speaker fakes for reconciler tests.

use async_trait::async_trait;
use halyard_core::device;
use halyard_core::error::Result;
use halyard_core::ipvs::{IpvsAction, IpvsService, ServiceKey};
use halyard_core::traits::{AddressBackend, BgpSpeaker, IptablesBackend, IpvsBackend};
use halyard_core::types::{AddressFamily, ObservedAddresses};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared model of everything the backends would program, with a counter
/// of mutating operations for idempotence assertions.
#[derive(Default)]
pub struct FakeKernel {
    pub addresses: Mutex<ObservedAddresses>,
    pub ipvs: Mutex<Vec<IpvsService>>,
    pub chain: Mutex<Vec<String>>,
    pub chain_exists: Mutex<bool>,
    pub announced_v4: Mutex<BTreeSet<String>>,
    pub announced_v6: Mutex<BTreeSet<String>>,
    mutations: AtomicUsize,
}

impl FakeKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeKernel::default())
    }

    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn ipvs_service(&self, vip: &str, port: u16) -> Option<IpvsService> {
        self.ipvs
            .lock()
            .iter()
            .find(|s| s.key.vip == vip && s.key.port == port)
            .cloned()
    }
}

pub struct FakeAddresses(pub Arc<FakeKernel>);

#[async_trait]
impl AddressBackend for FakeAddresses {
    async fn observe(&self) -> Result<ObservedAddresses> {
        Ok(self.0.addresses.lock().clone())
    }

    async fn add(&self, vip: &str, family: AddressFamily) -> Result<()> {
        let name = device::device_name(vip, family).expect("fake add with bad vip");
        let mut observed = self.0.addresses.lock();
        let list = match family {
            AddressFamily::V4 => &mut observed.v4,
            AddressFamily::V6 => &mut observed.v6,
        };
        if !list.contains(&name) {
            list.push(name);
        }
        self.0.mutated();
        Ok(())
    }

    async fn remove(&self, dev: &str, family: AddressFamily) -> Result<()> {
        let mut observed = self.0.addresses.lock();
        let list = match family {
            AddressFamily::V4 => &mut observed.v4,
            AddressFamily::V6 => &mut observed.v6,
        };
        list.retain(|d| d != dev);
        self.0.mutated();
        Ok(())
    }

    async fn set_mtu(&self, mtus: &HashMap<String, u32>, _family: AddressFamily) -> Result<()> {
        // nothing to compare against in the fake; a populated override map
        // would be a change
        if !mtus.is_empty() {
            self.0.mutated();
        }
        Ok(())
    }
}

pub struct FakeIpvs(pub Arc<FakeKernel>);

#[async_trait]
impl IpvsBackend for FakeIpvs {
    async fn observe(&self) -> Result<Vec<IpvsService>> {
        Ok(self.0.ipvs.lock().clone())
    }

    async fn apply(&self, actions: &[IpvsAction]) -> Result<()> {
        let mut table = self.0.ipvs.lock();
        for action in actions {
            self.0.mutated();
            match action {
                IpvsAction::AddService(svc) => {
                    let mut svc = svc.clone();
                    svc.destinations.clear();
                    table.push(svc);
                }
                IpvsAction::EditService(svc) => {
                    if let Some(cur) = find(&mut table, &svc.key) {
                        cur.scheduler = svc.scheduler.clone();
                        cur.sched_flags = svc.sched_flags.clone();
                        cur.persistence_timeout = svc.persistence_timeout;
                    }
                }
                IpvsAction::DeleteService(key) => table.retain(|s| &s.key != key),
                IpvsAction::AddDestination(key, dest) => {
                    if let Some(cur) = find(&mut table, key) {
                        cur.destinations.push(dest.clone());
                    }
                }
                IpvsAction::EditDestination(key, dest) => {
                    if let Some(cur) = find(&mut table, key) {
                        for d in cur.destinations.iter_mut() {
                            if d.endpoint() == dest.endpoint() {
                                *d = dest.clone();
                            }
                        }
                    }
                }
                IpvsAction::DeleteDestination(key, dest) => {
                    if let Some(cur) = find(&mut table, key) {
                        cur.destinations.retain(|d| d.endpoint() != dest.endpoint());
                    }
                }
            }
        }
        Ok(())
    }
}

fn find<'a>(table: &'a mut [IpvsService], key: &ServiceKey) -> Option<&'a mut IpvsService> {
    table.iter_mut().find(|s| &s.key == key)
}

pub struct FakeBgp(pub Arc<FakeKernel>);

#[async_trait]
impl BgpSpeaker for FakeBgp {
    async fn get(&self) -> Result<Vec<String>> {
        Ok(self.0.announced_v4.lock().iter().cloned().collect())
    }

    async fn set(&self, v4: &[String], prev: &[String], _communities: &[String]) -> Result<()> {
        let mut announced = self.0.announced_v4.lock();
        for addr in v4 {
            if announced.insert(addr.clone()) {
                self.0.mutated();
            }
        }
        for addr in prev {
            if !v4.contains(addr) && announced.remove(addr) {
                self.0.mutated();
            }
        }
        Ok(())
    }

    async fn set_v6(&self, v6: &[String], _communities: &[String]) -> Result<()> {
        let mut announced = self.0.announced_v6.lock();
        for addr in v6 {
            if announced.insert(addr.clone()) {
                self.0.mutated();
            }
        }
        Ok(())
    }
}

pub struct FakeIptables(pub Arc<FakeKernel>);

#[async_trait]
impl IptablesBackend for FakeIptables {
    async fn observe(&self) -> Result<Vec<String>> {
        Ok(self.0.chain.lock().clone())
    }

    async fn ensure_chain(&self) -> Result<()> {
        let mut exists = self.0.chain_exists.lock();
        if !*exists {
            *exists = true;
            self.0.mutated();
        }
        Ok(())
    }

    async fn append(&self, rule: &str) -> Result<()> {
        self.0.chain.lock().push(rule.to_string());
        self.0.mutated();
        Ok(())
    }

    async fn delete(&self, rule: &str) -> Result<()> {
        self.0.chain.lock().retain(|r| r != rule);
        self.0.mutated();
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.0.chain.lock().clear();
        self.0.mutated();
        Ok(())
    }
}
