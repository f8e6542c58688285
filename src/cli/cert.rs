use anyhow::Result;
use std::path::Path;

use crate::tls;

/// Generate self-signed TLS certificate
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    let sans = subject_alt_names(common_name, alt_names);

    tls::generate_self_signed_cert(
        common_name,
        &sans,
        Path::new(cert_out),
        Path::new(key_out),
    )?;

    println!("Generated self-signed certificate: {}", cert_out);
    println!("Generated private key: {}", key_out);
    println!("Serve with: ws-gateway serve --ssl-cert {} --ssl-key {}", cert_out, key_out);

    Ok(())
}

/// SAN 列表总是包含 CN
fn subject_alt_names(common_name: &str, alt_names: &[String]) -> Vec<String> {
    let mut sans = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !sans.iter().any(|n| n == common_name) {
        sans.push(common_name.to_string());
    }
    sans
}
