//! The default cipher preference string for legacy (manual-verification)
//! mode (spec.md §6).
//!
//! Implementations are told to preserve this exact sequence bit-for-bit
//! for peers that pin it, so it is spelled out as a single constant rather
//! than assembled at runtime.

/// Colon-separated cipher preference: modern ECDHE/DHE GCM and SHA
/// families first, then RC4/AES fallbacks, with the weak suites disabled
/// explicitly.
pub const DEFAULT_CIPHERS: &str = concat!(
    "ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES128-GCM-SHA256:",
    "ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES256-GCM-SHA384:",
    "DHE-RSA-AES128-GCM-SHA256:DHE-DSS-AES128-GCM-SHA256:",
    "ECDHE-RSA-AES128-SHA256:ECDHE-ECDSA-AES128-SHA256:",
    "ECDHE-RSA-AES128-SHA:ECDHE-ECDSA-AES128-SHA:",
    "ECDHE-RSA-AES256-SHA384:ECDHE-ECDSA-AES256-SHA384:",
    "ECDHE-RSA-AES256-SHA:ECDHE-ECDSA-AES256-SHA:",
    "DHE-RSA-AES128-SHA256:DHE-RSA-AES128-SHA:",
    "DHE-RSA-AES256-SHA256:DHE-RSA-AES256-SHA:",
    "ECDHE-RSA-DES-CBC3-SHA:ECDHE-ECDSA-DES-CBC3-SHA:",
    "AES128-GCM-SHA256:AES256-GCM-SHA384:",
    "AES128-SHA256:AES256-SHA256:",
    "AES128-SHA:AES256-SHA:",
    "DES-CBC3-SHA:",
    "HIGH:",
    "!aNULL:!eNULL:!EXPORT:!DES:!3DES:!MD5:!PSK"
);
