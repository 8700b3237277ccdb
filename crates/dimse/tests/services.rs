mod common;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use common::{sample_instance, scp_config, scu_config, start_scp, MemoryArchive};
use dimse::negotiation::propose;
use dimse::pdu::ResultReason;
use dimse::services::scu;
use dimse::{
    status, transcode, uids, Association, AssociationOptions, DimseError, DimseScp, DimseScu, RemoteNode,
    StaticDirectory, StoreRequest, SubOperations,
};

fn patient_name(obj: &InMemDicomObject) -> String {
    obj.element(tags::PATIENT_NAME)
        .unwrap()
        .to_str()
        .unwrap()
        .trim_end()
        .to_string()
}

#[tokio::test]
async fn echo_round_trip_over_tcp() {
    let archive = MemoryArchive::new();
    let scp = DimseScp::new(scp_config("ARCHIVE"), archive.providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    // Offer implicit first; the acceptor still picks explicit VR little endian.
    let options = AssociationOptions::new("VIEWER", "ARCHIVE");
    let proposed = propose([(
        uids::VERIFICATION,
        vec![uids::IMPLICIT_VR_LITTLE_ENDIAN, uids::EXPLICIT_VR_LITTLE_ENDIAN],
    )])
    .unwrap();
    let mut assoc = Association::open(&running.node.address(), &options, proposed).await.unwrap();

    let pc = &assoc.presentation_contexts()[0];
    assert_eq!(pc.result, ResultReason::Acceptance);
    assert_eq!(pc.transfer_syntax(), Some(uids::EXPLICIT_VR_LITTLE_ENDIAN));

    let outcome = scu::echo(&mut assoc).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, status::SUCCESS);
    assoc.release().await.unwrap();
    assert!(!assoc.is_established());
}

#[tokio::test]
async fn echo_through_scu_wrapper() {
    let scp = DimseScp::new(scp_config("ARCHIVE"), MemoryArchive::new().providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let scu = DimseScu::new(scu_config("VIEWER"));
    let outcome = scu.echo(&running.node).await.unwrap();
    assert!(outcome.success);
}

#[tokio::test]
async fn store_copies_bytes_when_syntaxes_match() {
    let archive = MemoryArchive::new();
    let scp = DimseScp::new(scp_config("ARCHIVE"), archive.providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let (metadata, data) = sample_instance("1.2.826.0.1.99.1", uids::EXPLICIT_VR_LITTLE_ENDIAN);
    let request = StoreRequest::new(
        &metadata.sop_class_uid,
        &metadata.sop_instance_uid,
        &metadata.transfer_syntax,
        data.clone(),
    );
    let outcomes = DimseScu::new(scu_config("MODALITY"))
        .store(&running.node, &[request])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);

    let (stored, bytes) = archive.get("1.2.826.0.1.99.1").unwrap();
    assert_eq!(stored.transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
    assert_eq!(stored.calling_ae_title, "MODALITY");
    assert_eq!(bytes, data);
}

#[tokio::test]
async fn store_reencodes_for_a_different_syntax() {
    let archive = MemoryArchive::new();
    let scp = DimseScp::new(scp_config("ARCHIVE"), archive.providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let (metadata, data) = sample_instance("1.2.826.0.1.99.2", uids::EXPLICIT_VR_LITTLE_ENDIAN);
    let options = AssociationOptions::new("MODALITY", "ARCHIVE");
    let proposed = propose([(metadata.sop_class_uid.as_str(), vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]).unwrap();
    let mut assoc = Association::open(&running.node.address(), &options, proposed).await.unwrap();

    let request = StoreRequest::new(
        &metadata.sop_class_uid,
        &metadata.sop_instance_uid,
        uids::EXPLICIT_VR_LITTLE_ENDIAN,
        data.clone(),
    );
    let outcome = scu::store(&mut assoc, &request).await.unwrap();
    assert!(outcome.success);
    assoc.release().await.unwrap();

    let (stored, bytes) = archive.get("1.2.826.0.1.99.2").unwrap();
    assert_eq!(stored.transfer_syntax, uids::IMPLICIT_VR_LITTLE_ENDIAN);
    assert_ne!(bytes, data);
    let decoded = transcode::read_data_set(&bytes, uids::IMPLICIT_VR_LITTLE_ENDIAN).unwrap();
    assert_eq!(patient_name(&decoded), "Doe^Jane");
}

#[tokio::test]
async fn store_fragments_large_data_sets() {
    let archive = MemoryArchive::new();
    let config = dimse::DimseConfig { max_pdu: 64, ..scp_config("ARCHIVE") };
    let scp = DimseScp::new(config, archive.providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let (metadata, data) = sample_instance("1.2.826.0.1.99.3", uids::EXPLICIT_VR_LITTLE_ENDIAN);
    assert!(data.len() > 58);
    let request = StoreRequest::new(
        &metadata.sop_class_uid,
        &metadata.sop_instance_uid,
        &metadata.transfer_syntax,
        data.clone(),
    );
    let node = running.node.clone().with_max_pdu(64);
    let outcomes = DimseScu::new(scu_config("MODALITY")).store(&node, &[request]).await.unwrap();
    assert!(outcomes[0].success);

    // Data set lengths are even, so no pad byte was added.
    let (_, bytes) = archive.get("1.2.826.0.1.99.3").unwrap();
    assert_eq!(bytes, data);
}

#[tokio::test]
async fn find_delivers_every_pending_identifier() {
    let archive = MemoryArchive::new();
    for uid in ["1.2.826.0.1.99.11", "1.2.826.0.1.99.12", "1.2.826.0.1.99.13"] {
        let (metadata, data) = sample_instance(uid, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        archive.insert(metadata, data);
    }
    let scp = DimseScp::new(scp_config("ARCHIVE"), archive.providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let found = Arc::new(Mutex::new(Vec::new()));
    let sink = found.clone();
    let outcome = DimseScu::new(scu_config("VIEWER"))
        .find(
            &running.node,
            uids::STUDY_ROOT_QR_FIND,
            &InMemDicomObject::new_empty(),
            Box::new(move |identifier| {
                sink.lock().unwrap().push(patient_name(&identifier));
                Ok(())
            }),
        )
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.status, status::SUCCESS);
    assert_eq!(outcome.matches, 3);
    assert_eq!(found.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn find_without_provider_is_not_supported() {
    let scp = DimseScp::new(scp_config("ARCHIVE"), dimse::Providers::new()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let outcome = DimseScu::new(scu_config("VIEWER"))
        .find(
            &running.node,
            uids::STUDY_ROOT_QR_FIND,
            &InMemDicomObject::new_empty(),
            Box::new(|_| Ok(())),
        )
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.status, status::SOP_CLASS_NOT_SUPPORTED);
    assert_eq!(outcome.matches, 0);
}

#[tokio::test]
async fn get_returns_instances_on_the_same_association() {
    let source = MemoryArchive::new();
    for uid in ["1.2.826.0.1.99.21", "1.2.826.0.1.99.22"] {
        let (metadata, data) = sample_instance(uid, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        source.insert(metadata, data);
    }
    let scp = DimseScp::new(scp_config("ARCHIVE"), source.providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let local = MemoryArchive::new();
    let progress = Arc::new(Mutex::new(Vec::<SubOperations>::new()));
    let seen = progress.clone();
    let outcome = DimseScu::new(scu_config("VIEWER"))
        .get(
            &running.node,
            uids::STUDY_ROOT_QR_GET,
            &InMemDicomObject::new_empty(),
            local.clone(),
            Some(Box::new(move |counts: &SubOperations| seen.lock().unwrap().push(*counts))),
        )
        .await
        .unwrap();

    assert!(outcome.success, "{:?}", outcome);
    assert_eq!(outcome.counts.completed, 2);
    assert_eq!(outcome.counts.failed, 0);
    assert_eq!(local.len(), 2);
    assert_eq!(local.get("1.2.826.0.1.99.22").unwrap().0.calling_ae_title, "ARCHIVE");

    let progress = progress.lock().unwrap();
    assert_eq!(progress.first().and_then(|c| c.remaining), Some(1));
}

#[tokio::test]
async fn move_forwards_to_the_destination() {
    let destination = MemoryArchive::new();
    let dest_scp = DimseScp::new(scp_config("WORKSTATION"), destination.providers()).unwrap();
    let dest = start_scp(dest_scp, "WORKSTATION").await;

    let source = MemoryArchive::new();
    for uid in ["1.2.826.0.1.99.31", "1.2.826.0.1.99.32", "1.2.826.0.1.99.33"] {
        let (metadata, data) = sample_instance(uid, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        source.insert(metadata, data);
    }
    let directory = StaticDirectory::new().with_node(dest.node.clone());
    let scp = DimseScp::new(scp_config("ARCHIVE"), source.providers())
        .unwrap()
        .with_directory(Arc::new(directory));
    let running = start_scp(scp, "ARCHIVE").await;

    let outcome = DimseScu::new(scu_config("VIEWER"))
        .move_request(
            &running.node,
            uids::STUDY_ROOT_QR_MOVE,
            "WORKSTATION",
            &InMemDicomObject::new_empty(),
            None,
        )
        .await
        .unwrap();

    assert!(outcome.success, "{:?}", outcome);
    assert_eq!(outcome.counts.completed, 3);
    assert_eq!(outcome.pending_responses, 2);
    assert!(!outcome.stalled);
    assert_eq!(destination.len(), 3);
    let (stored, _) = destination.get("1.2.826.0.1.99.31").unwrap();
    assert_eq!(stored.move_originator_ae_title.as_deref(), Some("VIEWER"));
    assert_eq!(stored.calling_ae_title, "ARCHIVE");
}

#[tokio::test]
async fn move_to_unknown_destination_fails() {
    let source = MemoryArchive::new();
    let (metadata, data) = sample_instance("1.2.826.0.1.99.41", uids::EXPLICIT_VR_LITTLE_ENDIAN);
    source.insert(metadata, data);
    let scp = DimseScp::new(scp_config("ARCHIVE"), source.providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let outcome = DimseScu::new(scu_config("VIEWER"))
        .move_request(
            &running.node,
            uids::STUDY_ROOT_QR_MOVE,
            "NOWHERE",
            &InMemDicomObject::new_empty(),
            None,
        )
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.status, status::MOVE_DESTINATION_UNKNOWN);
}

#[tokio::test]
async fn called_ae_title_is_checked_when_required() {
    let config = dimse::DimseConfig { require_called_ae_title: true, ..scp_config("ARCHIVE") };
    let scp = DimseScp::new(config, MemoryArchive::new().providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let wrong = RemoteNode::new("SOMEONE_ELSE", "127.0.0.1", running.addr.port());
    let err = DimseScu::new(scu_config("VIEWER")).echo(&wrong).await.unwrap_err();
    assert!(
        matches!(err, DimseError::AssociationRejected { result: 1, source_id: 1, reason: 7 }),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn association_limit_rejects_transiently() {
    let config = dimse::DimseConfig { max_associations: 1, ..scp_config("ARCHIVE") };
    let scp = DimseScp::new(config, MemoryArchive::new().providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let options = AssociationOptions::new("VIEWER", "ARCHIVE");
    let proposed = || propose([(uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]).unwrap();
    let mut first = Association::open(&running.node.address(), &options, proposed()).await.unwrap();

    let err = Association::open(&running.node.address(), &options, proposed()).await.unwrap_err();
    assert!(
        matches!(err, DimseError::AssociationRejected { result: 2, source_id: 3, reason: 2 }),
        "{:?}",
        err
    );
    first.release().await.unwrap();
}

#[tokio::test]
async fn unreachable_peer_is_a_provider_abort() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let node = RemoteNode::new("GONE", "127.0.0.1", port);
    let err = DimseScu::new(scu_config("VIEWER")).echo(&node).await.unwrap_err();
    match err {
        DimseError::ProviderAbort { peer, .. } => assert_eq!(peer, format!("127.0.0.1:{}", port)),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn stores_are_counted_per_instance() {
    let archive = MemoryArchive::new();
    let config = dimse::DimseConfig {
        policy: dimse::SelectionPolicy::new(
            dimse::AbstractSyntaxPolicy::Custom(vec![uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string()]),
            dimse::TransferSyntaxPolicy::AnyExplicit,
        ),
        ..scp_config("ARCHIVE")
    };
    let scp = DimseScp::new(config, archive.providers()).unwrap();
    let running = start_scp(scp, "ARCHIVE").await;

    let (metadata, data) = sample_instance("1.2.826.0.1.99.51", uids::EXPLICIT_VR_LITTLE_ENDIAN);
    let accepted = StoreRequest::new(&metadata.sop_class_uid, "1.2.826.0.1.99.51", &metadata.transfer_syntax, data.clone());
    let refused = StoreRequest::new(uids::CT_IMAGE_STORAGE, "1.2.826.0.1.99.52", &metadata.transfer_syntax, Bytes::new());

    let outcomes = DimseScu::new(scu_config("MODALITY"))
        .store(&running.node, &[accepted, refused])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].success);
    assert!(!outcomes[1].success);
    assert_eq!(archive.len(), 1);
}
