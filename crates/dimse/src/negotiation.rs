//! Presentation context negotiation
//!
//! The acceptor runs proposed contexts through three passes in order:
//! abstract syntax selection, transfer syntax selection and the explicit VR
//! preference pass. Abstract and transfer syntax policies are independent
//! values composed by [`SelectionPolicy`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DimseError, Result};
use crate::pdu::{PresentationContextProposed, PresentationContextResult, ResultReason, RoleSelection};
use crate::uids;

/// Which abstract syntaxes (SOP classes) an acceptor is willing to serve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbstractSyntaxPolicy {
    /// Storage SOP classes and Verification
    StorageVerification,
    /// Storage, Query/Retrieve (FIND, MOVE, GET) and Verification
    StorageQueryRetrieveVerification,
    /// An explicit list of abstract syntax UIDs
    Custom(Vec<String>),
}

impl Default for AbstractSyntaxPolicy {
    fn default() -> Self {
        Self::StorageQueryRetrieveVerification
    }
}

impl AbstractSyntaxPolicy {
    pub fn supports(&self, abstract_syntax: &str) -> bool {
        match self {
            Self::StorageVerification => {
                abstract_syntax == uids::VERIFICATION || uids::is_storage_sop_class(abstract_syntax)
            }
            Self::StorageQueryRetrieveVerification => {
                abstract_syntax == uids::VERIFICATION
                    || uids::is_storage_sop_class(abstract_syntax)
                    || uids::QUERY_FIND_SOP_CLASSES.contains(&abstract_syntax)
                    || uids::RETRIEVE_MOVE_SOP_CLASSES.contains(&abstract_syntax)
                    || uids::RETRIEVE_GET_SOP_CLASSES.contains(&abstract_syntax)
            }
            Self::Custom(list) => list.iter().any(|uid| uid == abstract_syntax),
        }
    }
}

/// Which explicit VR transfer syntaxes qualify during transfer syntax selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferSyntaxPolicy {
    /// Any recognized explicit VR transfer syntax, compressed ones included
    #[default]
    AnyExplicit,
    /// Only explicit VR transfer syntaxes without encapsulated pixel data
    UnencapsulatedExplicit,
}

impl TransferSyntaxPolicy {
    pub fn qualifies(&self, transfer_syntax: &str) -> bool {
        match self {
            Self::AnyExplicit => uids::is_explicit_vr(transfer_syntax),
            Self::UnencapsulatedExplicit => {
                uids::is_explicit_vr(transfer_syntax) && !uids::is_encapsulated(transfer_syntax)
            }
        }
    }
}

/// Composition of an abstract syntax policy and a transfer syntax policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    #[serde(default)]
    pub abstract_syntax: AbstractSyntaxPolicy,
    #[serde(default)]
    pub transfer_syntax: TransferSyntaxPolicy,
}

impl SelectionPolicy {
    pub fn new(abstract_syntax: AbstractSyntaxPolicy, transfer_syntax: TransferSyntaxPolicy) -> Self {
        Self { abstract_syntax, transfer_syntax }
    }

    /// Runs the three selection passes over the proposed contexts.
    pub fn select(&self, proposed: &[PresentationContextProposed]) -> Vec<PresentationContext> {
        let mut contexts: Vec<PresentationContext> = proposed.iter().map(PresentationContext::from).collect();
        self.apply(&mut contexts);
        contexts
    }

    /// Runs the passes in place. Contexts already rejected are left alone,
    /// so applying the policy to its own output changes nothing.
    pub fn apply(&self, contexts: &mut [PresentationContext]) {
        self.select_abstract_syntaxes(contexts);
        self.select_transfer_syntaxes(contexts);
        apply_explicit_vr_preference(contexts);
    }

    fn select_abstract_syntaxes(&self, contexts: &mut [PresentationContext]) {
        for pc in contexts.iter_mut().filter(|pc| pc.is_accepted()) {
            if !self.abstract_syntax.supports(&pc.abstract_syntax) {
                debug!(id = pc.id, abstract_syntax = %pc.abstract_syntax, "abstract syntax not supported");
                pc.reject(ResultReason::AbstractSyntaxNotSupported);
            }
        }
    }

    fn select_transfer_syntaxes(&self, contexts: &mut [PresentationContext]) {
        for pc in contexts.iter_mut().filter(|pc| pc.is_accepted()) {
            let explicit = pc
                .transfer_syntaxes
                .iter()
                .find(|ts| self.transfer_syntax.qualifies(ts))
                .cloned();
            let chosen = explicit.or_else(|| {
                pc.transfer_syntaxes
                    .iter()
                    .find(|ts| ts.as_str() == uids::IMPLICIT_VR_LITTLE_ENDIAN)
                    .cloned()
            });
            match chosen {
                Some(ts) => pc.transfer_syntaxes = vec![ts],
                None => {
                    debug!(id = pc.id, offered = ?pc.transfer_syntaxes, "no acceptable transfer syntax");
                    pc.reject(ResultReason::TransferSyntaxNotSupported);
                }
            }
        }
    }
}

/// Rejects implicit VR contexts whose abstract syntax was also accepted with
/// an explicit VR transfer syntax on a sibling context.
pub fn apply_explicit_vr_preference(contexts: &mut [PresentationContext]) {
    let with_explicit: HashSet<String> = contexts
        .iter()
        .filter(|pc| pc.is_accepted())
        .filter(|pc| pc.transfer_syntax().is_some_and(uids::is_explicit_vr))
        .map(|pc| pc.abstract_syntax.clone())
        .collect();

    for pc in contexts.iter_mut().filter(|pc| pc.is_accepted()) {
        if pc.transfer_syntax() == Some(uids::IMPLICIT_VR_LITTLE_ENDIAN) && with_explicit.contains(&pc.abstract_syntax)
        {
            debug!(id = pc.id, abstract_syntax = %pc.abstract_syntax, "implicit VR sibling shadowed by explicit VR context");
            pc.reject(ResultReason::NoReason);
        }
    }
}

/// A presentation context as tracked by an association.
///
/// Before negotiation `transfer_syntaxes` holds the proposed candidates; once
/// accepted it holds exactly one entry, once rejected it is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
    pub result: ResultReason,
}

impl From<&PresentationContextProposed> for PresentationContext {
    fn from(pc: &PresentationContextProposed) -> Self {
        Self {
            id: pc.id,
            abstract_syntax: pc.abstract_syntax.clone(),
            transfer_syntaxes: pc.transfer_syntaxes.clone(),
            result: ResultReason::Acceptance,
        }
    }
}

impl PresentationContext {
    pub fn is_accepted(&self) -> bool {
        self.result == ResultReason::Acceptance
    }

    /// The agreed transfer syntax, once exactly one remains
    pub fn transfer_syntax(&self) -> Option<&str> {
        match (self.is_accepted(), self.transfer_syntaxes.as_slice()) {
            (true, [ts]) => Some(ts.as_str()),
            _ => None,
        }
    }

    fn reject(&mut self, reason: ResultReason) {
        self.result = reason;
        self.transfer_syntaxes.clear();
    }

    pub fn to_result(&self) -> PresentationContextResult {
        PresentationContextResult {
            id: self.id,
            reason: self.result,
            transfer_syntax: self.transfer_syntax().unwrap_or_default().to_string(),
        }
    }
}

/// Assigns odd presentation context IDs (1, 3, ..., 255) to proposals.
pub fn propose<A, T>(proposals: impl IntoIterator<Item = (A, Vec<T>)>) -> Result<Vec<PresentationContextProposed>>
where
    A: Into<String>,
    T: Into<String>,
{
    let mut contexts = Vec::new();
    for (index, (abstract_syntax, transfer_syntaxes)) in proposals.into_iter().enumerate() {
        let id = u8::try_from(index * 2 + 1)
            .map_err(|_| DimseError::config("no more than 128 presentation contexts can be proposed"))?;
        let transfer_syntaxes: Vec<String> = transfer_syntaxes.into_iter().map(Into::into).collect();
        if transfer_syntaxes.is_empty() {
            return Err(DimseError::config(format!("presentation context {} proposes no transfer syntax", id)));
        }
        contexts.push(PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
        });
    }
    if contexts.is_empty() {
        return Err(DimseError::config("at least one presentation context must be proposed"));
    }
    Ok(contexts)
}

/// Pairs the acceptor's results with what we proposed.
///
/// Contexts the acceptor did not answer are treated as rejected.
pub fn apply_results(
    proposed: &[PresentationContextProposed],
    results: &[PresentationContextResult],
) -> Result<Vec<PresentationContext>> {
    let mut contexts = Vec::with_capacity(proposed.len());
    for pc in proposed {
        let context = match results.iter().find(|r| r.id == pc.id) {
            Some(r) if r.reason == ResultReason::Acceptance => {
                if r.transfer_syntax.is_empty() {
                    return Err(DimseError::protocol(format!(
                        "presentation context {} accepted without a transfer syntax",
                        pc.id
                    )));
                }
                PresentationContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntaxes: vec![r.transfer_syntax.clone()],
                    result: ResultReason::Acceptance,
                }
            }
            Some(r) => PresentationContext {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntaxes: Vec::new(),
                result: r.reason,
            },
            None => PresentationContext {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntaxes: Vec::new(),
                result: ResultReason::NoReason,
            },
        };
        contexts.push(context);
    }
    Ok(contexts)
}

/// Answers role selection proposals for abstract syntaxes we accepted,
/// granting the roles the requester asked for.
pub fn negotiate_roles(requested: &[RoleSelection], accepted: &[PresentationContext]) -> Vec<RoleSelection> {
    requested
        .iter()
        .filter(|role| {
            accepted
                .iter()
                .any(|pc| pc.is_accepted() && pc.abstract_syntax == role.sop_class_uid)
        })
        .cloned()
        .collect()
}
