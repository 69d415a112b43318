//! Custom resources in the `projectcontour.io` API group.

pub mod delegation;
pub mod http_proxy;

pub use self::{
    delegation::{CertificateDelegation, TlsCertificateDelegation, TlsCertificateDelegationSpec},
    http_proxy::*,
};

pub const GROUP: &str = "projectcontour.io";
pub const API_VERSION: &str = "projectcontour.io/v1";
