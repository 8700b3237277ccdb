#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use dimse::provider::{FindProvider, InstanceMetadata, InstanceRef, Matches, Providers, Query, RetrieveProvider, StorageSink};
use dimse::{status, transcode, uids, DimseConfig, DimseScp, RemoteNode, Result};

/// Keeps everything it is given in memory
#[derive(Default)]
pub struct MemoryArchive {
    instances: Mutex<Vec<(InstanceMetadata, Bytes)>>,
}

impl MemoryArchive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, metadata: InstanceMetadata, data: Bytes) {
        self.instances.lock().unwrap().push((metadata, data));
    }

    pub fn len(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn get(&self, sop_instance_uid: &str) -> Option<(InstanceMetadata, Bytes)> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .find(|(m, _)| m.sop_instance_uid == sop_instance_uid)
            .cloned()
    }

    pub fn providers(self: &Arc<Self>) -> Providers {
        Providers::new()
            .with_storage(self.clone())
            .with_find(self.clone())
            .with_retrieve(self.clone())
    }
}

#[async_trait]
impl StorageSink for MemoryArchive {
    async fn store(&self, metadata: &InstanceMetadata, data: Bytes) -> Result<u16> {
        self.insert(metadata.clone(), data);
        Ok(status::SUCCESS)
    }
}

#[async_trait]
impl FindProvider for MemoryArchive {
    async fn find(&self, _query: &Query) -> Result<Matches> {
        let instances = self.instances.lock().unwrap().clone();
        let matches = instances
            .into_iter()
            .map(|(metadata, data)| transcode::read_data_set(&data, &metadata.transfer_syntax));
        Ok(Box::new(matches.collect::<Vec<_>>().into_iter()))
    }
}

#[async_trait]
impl RetrieveProvider for MemoryArchive {
    async fn retrieve(&self, _query: &Query) -> Result<Vec<InstanceRef>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| InstanceRef {
                sop_class_uid: m.sop_class_uid.clone(),
                sop_instance_uid: m.sop_instance_uid.clone(),
                transfer_syntax: m.transfer_syntax.clone(),
            })
            .collect())
    }

    async fn load(&self, instance: &InstanceRef) -> Result<Bytes> {
        self.get(&instance.sop_instance_uid)
            .map(|(_, data)| data)
            .ok_or_else(|| dimse::DimseError::storage(format!("{} is gone", instance.sop_instance_uid)))
    }
}

pub fn sample_object(sop_instance_uid: &str, patient: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, patient)),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "P001")),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.826.0.1.99.10")),
    ])
}

/// A sample instance encoded in `transfer_syntax`
pub fn sample_instance(sop_instance_uid: &str, transfer_syntax: &str) -> (InstanceMetadata, Bytes) {
    let bytes = transcode::write_data_set(&sample_object(sop_instance_uid, "Doe^Jane"), transfer_syntax).unwrap();
    let metadata = InstanceMetadata {
        id: uuid::Uuid::new_v4(),
        sop_class_uid: uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string(),
        sop_instance_uid: sop_instance_uid.to_string(),
        transfer_syntax: transfer_syntax.to_string(),
        calling_ae_title: "SEED".to_string(),
        move_originator_ae_title: None,
        received_at: chrono::Utc::now(),
        size_bytes: bytes.len() as u64,
    };
    (metadata, Bytes::from(bytes))
}

pub fn scp_config(ae_title: &str) -> DimseConfig {
    DimseConfig {
        local_aet: ae_title.to_string(),
        accept_poll_ms: 50,
        move_fallback_ports: Vec::new(),
        ..Default::default()
    }
}

pub struct RunningScp {
    pub addr: SocketAddr,
    pub node: RemoteNode,
    shutdown: CancellationToken,
}

impl Drop for RunningScp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Starts an SCP on an ephemeral local port
pub async fn start_scp(scp: DimseScp, ae_title: &str) -> RunningScp {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    let shutdown = scp.shutdown_token();
    tokio::spawn(scp.serve(listener));
    RunningScp {
        addr,
        node: RemoteNode::new(ae_title, "127.0.0.1", addr.port()),
        shutdown,
    }
}

pub fn scu_config(ae_title: &str) -> DimseConfig {
    DimseConfig {
        local_aet: ae_title.to_string(),
        connect_timeout_ms: 5_000,
        ..Default::default()
    }
}
