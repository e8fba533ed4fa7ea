//! Shared helpers for connection-plane integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bytes::BytesMut;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, Ia5String, IsCa, KeyPair, SanType,
};

use relayd_net::event::{Dispatcher, RunType};
use relayd_net::filter::ConnectionOps;
use relayd_net::{
    Connection, ConnectionCallbacks, ConnectionEvent, FilterStatus, ReadFilter,
};

/// A CA plus helpers to mint leaf certificates signed by it.
pub struct TestCa {
    pub cert_path: PathBuf,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

pub struct TestCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub der: Vec<u8>,
}

impl TestCa {
    pub fn new(dir: &Path) -> TestCa {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "test ca");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let cert_path = dir.join("ca.pem");
        std::fs::write(&cert_path, ca_cert.pem()).unwrap();

        TestCa {
            cert_path,
            ca_cert,
            ca_key,
        }
    }

    /// Leaf with a DNS SAN and optionally a URI SAN.
    pub fn issue(&self, dir: &Path, name: &str, uri_san: Option<&str>) -> TestCert {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, name);
        params
            .subject_alt_names
            .push(SanType::DnsName(Ia5String::try_from(name.to_string()).unwrap()));
        if let Some(uri) = uri_san {
            params
                .subject_alt_names
                .push(SanType::URI(Ia5String::try_from(uri.to_string()).unwrap()));
        }

        let key = KeyPair::generate().unwrap();
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .unwrap();

        let cert_path = dir.join(format!("{name}-{}.pem", uri_san.is_some()));
        let key_path = dir.join(format!("{name}-{}.key.pem", uri_san.is_some()));
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        TestCert {
            cert_path,
            key_path,
            der: cert.der().to_vec(),
        }
    }
}

/// Read filter that records chunk sizes and accumulates payload bytes.
pub struct CollectFilter {
    pub chunks: Rc<RefCell<Vec<usize>>>,
    pub data: Rc<RefCell<Vec<u8>>>,
}

impl ReadFilter for CollectFilter {
    fn on_data(&mut self, data: &mut BytesMut, _conn: &mut dyn ConnectionOps) -> FilterStatus {
        self.chunks.borrow_mut().push(data.len());
        self.data.borrow_mut().extend_from_slice(data);
        data.clear();
        FilterStatus::Continue
    }
}

/// Read filter that writes everything straight back.
pub struct EchoBackFilter;

impl ReadFilter for EchoBackFilter {
    fn on_data(&mut self, data: &mut BytesMut, conn: &mut dyn ConnectionOps) -> FilterStatus {
        conn.write(data);
        data.clear();
        FilterStatus::StopIteration
    }
}

/// Connection callbacks that count events.
#[derive(Default)]
pub struct EventRecorder {
    pub connected: Cell<u32>,
    pub local_close: Cell<u32>,
    pub remote_close: Cell<u32>,
}

impl ConnectionCallbacks for EventRecorder {
    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.connected.set(self.connected.get() + 1),
            ConnectionEvent::LocalClose => self.local_close.set(self.local_close.get() + 1),
            ConnectionEvent::RemoteClose => self.remote_close.set(self.remote_close.get() + 1),
        }
    }
}

/// Pump the dispatcher until `cond` holds or the budget runs out.
pub fn run_until(dispatcher: &Rc<Dispatcher>, mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..10_000 {
        if cond() {
            return true;
        }
        dispatcher.run(RunType::NonBlock);
        std::thread::sleep(std::time::Duration::from_micros(200));
    }
    cond()
}

/// Keep a `Connection` plus its observers together in tests.
pub struct HeldConnection {
    pub connection: Connection,
    pub events: Rc<EventRecorder>,
    pub chunks: Rc<RefCell<Vec<usize>>>,
    pub data: Rc<RefCell<Vec<u8>>>,
}
