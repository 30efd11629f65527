//! Structural checks on a PEM certificate signing request.
//!
//! Only the PEM framing is checked here; the CA parses the ASN.1.

use rustls_pki_types::pem::{PemObject, SectionKind};

/// Upper bound on an accepted PEM document.
pub const MAX_CSR_BYTES: usize = 16 * 1024;

/// Returns the trimmed PEM when it holds exactly one CSR section and nothing
/// else.
pub fn validate_csr(csr: &str) -> Option<&str> {
    let csr = csr.trim();
    if csr.is_empty() || csr.len() > MAX_CSR_BYTES {
        return None;
    }

    let sections = <(SectionKind, Vec<u8>)>::pem_slice_iter(csr.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tracing::debug!(error = ?e, "CSR is not valid PEM"))
        .ok()?;

    match sections.as_slice() {
        [(SectionKind::Csr, der)] if !der.is_empty() => Some(csr),
        _ => None,
    }
}
