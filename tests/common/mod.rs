#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Builder, X509NameBuilder, X509NameRef, X509};
use tokio::sync::Notify;

use spiffe_helper::config::X509Files;
use spiffe_helper::credential::{CertificateDer, PrivateKeyDer};
use spiffe_helper::notify::PidSignaler;
use spiffe_helper::process::{
    ChildProcess, CommandSpec, ProcessError, SignalSender, Spawner, WaitFuture,
};
use spiffe_helper::{RotationConfig, Signal, X509Update};

pub const SVID_FILE: &str = "svid.pem";
pub const KEY_FILE: &str = "svid_key.pem";
pub const BUNDLE_FILE: &str = "svid_bundle.pem";

/// Config writing the X.509 file set into `dir`.
pub fn x509_config(dir: &Path) -> RotationConfig {
    RotationConfig {
        cert_dir: dir.to_path_buf(),
        x509: Some(X509Files {
            svid_file_name: SVID_FILE.into(),
            svid_key_file_name: KEY_FILE.into(),
            svid_bundle_file_name: BUNDLE_FILE.into(),
        }),
        ..RotationConfig::default()
    }
}

/// Polls `cond` every 10ms for up to 5s.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

pub struct Issued {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl Issued {
    pub fn der(&self) -> CertificateDer {
        CertificateDer::from(self.cert.to_der().unwrap())
    }

    pub fn key_der(&self) -> PrivateKeyDer {
        PrivateKeyDer::from(self.key.private_key_to_pkcs8().unwrap())
    }
}

fn issue(common_name: &str, serial: u32, is_ca: bool, issuer: Option<&Issued>) -> Issued {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    let issuer_name: &X509NameRef = match issuer {
        Some(issuer) => issuer.cert.subject_name(),
        None => &name,
    };
    builder.set_issuer_name(issuer_name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    if is_ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
    }
    let signer = match issuer {
        Some(issuer) => &issuer.key,
        None => &key,
    };
    builder.sign(signer, MessageDigest::sha256()).unwrap();

    Issued {
        cert: builder.build(),
        key,
    }
}

/// A root CA, an intermediate and a leaf issued by the intermediate.
pub struct TestPki {
    pub root: Issued,
    pub intermediate: Issued,
    pub leaf: Issued,
}

impl TestPki {
    pub fn new(serial: u32) -> Self {
        let root = issue("root", serial, true, None);
        let intermediate = issue("intermediate", serial + 1, true, Some(&root));
        let leaf = issue("workload", serial + 2, false, Some(&intermediate));
        Self {
            root,
            intermediate,
            leaf,
        }
    }

    /// Leaf and intermediate in the chain, root in the bundle.
    pub fn update(&self) -> X509Update {
        X509Update {
            chain: vec![self.leaf.der(), self.intermediate.der()],
            key: self.leaf.key_der(),
            bundle: vec![self.root.der()],
            federated_bundles: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Process fakes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Exit(i32),
    Hang,
    Fail,
}

/// Spawns scripted children with PIDs from 1000. Runs out into `Hang`.
#[derive(Debug, Default)]
pub struct FakeSpawner {
    script: Mutex<VecDeque<Script>>,
    spawned: AtomicU32,
}

impl FakeSpawner {
    pub fn new(script: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            spawned: AtomicU32::new(0),
        })
    }

    pub fn spawned(&self) -> u32 {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, _spec: &CommandSpec) -> io::Result<Box<dyn ChildProcess>> {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Hang);
        let code = match step {
            Script::Fail => return Err(io::Error::from(io::ErrorKind::NotFound)),
            Script::Exit(code) => Some(code),
            Script::Hang => None,
        };
        let pid = 1000 + self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChild {
            pid,
            code,
            killed: Arc::new(Notify::new()),
        }))
    }
}

#[derive(Debug)]
pub struct FakeChild {
    pid: u32,
    code: Option<i32>,
    killed: Arc<Notify>,
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> WaitFuture<'_> {
        let code = self.code;
        let killed = Arc::clone(&self.killed);
        Box::pin(async move {
            match code {
                Some(code) => Ok(code),
                None => {
                    killed.notified().await;
                    Ok(137)
                }
            }
        })
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.killed.notify_one();
        Ok(())
    }
}

/// Records every signal instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingSignals {
    sent: Mutex<Vec<(u32, Signal)>>,
}

impl RecordingSignals {
    pub fn sent(&self) -> Vec<(u32, Signal)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, signal: Signal) -> usize {
        self.sent().iter().filter(|(_, s)| *s == signal).count()
    }
}

impl SignalSender for RecordingSignals {
    fn send(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        self.sent.lock().unwrap().push((pid, signal));
        Ok(())
    }
}

/// PID-file capability returning a fixed PID.
#[derive(Debug)]
pub struct RecordingPidSignaler {
    pid: u32,
    sent: Mutex<Vec<(u32, Signal)>>,
}

impl RecordingPidSignaler {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<(u32, Signal)> {
        self.sent.lock().unwrap().clone()
    }
}

impl PidSignaler for RecordingPidSignaler {
    fn read_pid(&self) -> Result<u32, spiffe_helper::notify::PidFileError> {
        Ok(self.pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        self.sent.lock().unwrap().push((pid, signal));
        Ok(())
    }
}
