//! DICOM Upper Layer protocol and DIMSE services
//!
//! This crate implements the association handshake, presentation context
//! negotiation, PDU framing and fragmentation, and the composite services
//! (C-ECHO, C-STORE, C-FIND, C-MOVE, C-GET) on both the requesting (SCU)
//! and accepting (SCP) side.
//!
//! # Features
//! - Association state machine with orderly release and abort handling
//! - Acceptor-side negotiation driven by composable selection policies
//! - Per-service status evaluation with C-MOVE/C-GET stall detection
//! - C-MOVE forwarding over nested associations, C-GET over the same one
//! - TLS support (optional, feature = "tls")
//!
//! Data sets are handled as opaque bytes plus a transfer syntax; storing,
//! matching and loading them is left to the traits in [`provider`].

pub mod association;
pub mod command;
pub mod config;
pub mod error;
pub mod fragment;
pub mod negotiation;
pub mod pdu;
pub mod provider;
pub mod server;
pub mod services;
pub mod status;
pub mod tls;
pub mod transcode;
pub mod uids;

// Re-export commonly used types
pub use association::{AcceptOptions, Association, AssociationOptions, WaitOutcome};
pub use command::{CommandField, CommandMessage, Priority, SubOperations};
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use negotiation::{AbstractSyntaxPolicy, PresentationContext, SelectionPolicy, TransferSyntaxPolicy};
pub use provider::{FindProvider, InstanceMetadata, InstanceRef, Providers, Query, RetrieveProvider, StorageSink};
pub use server::DimseScp;
pub use services::{AeDirectory, DestinationResolver, DimseScu, StaticDirectory, StoreRequest};
pub use status::{EchoOutcome, FindOutcome, RetrieveOutcome, StoreOutcome};
pub use tls::TlsSettings;

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Default TLS DICOM port
pub const DEFAULT_DIMSE_TLS_PORT: u16 = 2762;
