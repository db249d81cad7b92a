//! rproxy - keeps an nginx reverse proxy's site configs and certificates current
//!
//! This library provides:
//! - Loading of per-site descriptors from a site directory
//! - Rendering of one nginx config per site, HTTP-only or HTTPS depending on
//!   whether the site has a certificate
//! - Certificate issuance through a built-in ACME client or an external one,
//!   including terms-of-service agreement and HTTP-01 challenge files
//! - A daily renewal pass that rewrites configs of renewed sites
//! - Supervision of the served process: start, reload, restart on death

pub mod acme;
pub mod certificate;
pub mod config;
pub mod daemon;
pub mod error;
pub mod external;
pub mod issuer;
pub mod process;
pub mod render;
pub mod scheduler;
pub mod site;
pub mod writer;
