//! Composite DIMSE services on top of an established association

pub mod destination;
pub mod handler;
pub mod scp;
pub mod scu;

pub use destination::{AeDirectory, DestinationResolver, StaticDirectory};
pub use handler::{CompositeResponseHandler, Message, MessageAssembler, MessageReader, ResponseHandler};
pub use scp::RequestDispatcher;
pub use scu::{DimseScu, StoreRequest};
