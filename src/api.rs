//! The wire surface: message wrappers shared by every transport and the
//! serialization schemas that project them onto the two wire forms.

pub mod message;
pub mod schema;
