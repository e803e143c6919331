//! raind-hook - OCI hook helper.
//!
//! The runtime runs this at every lifecycle point with the container state
//! on stdin. On `createRuntime` the helper first obtains a client
//! certificate for the container, then it reports the event to raindd over
//! mutual TLS with that certificate.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, bail, eyre};
use raind::pki::{CA_CERT, SpiffeId, container_csr};
use raind_common::RaindPaths;
use raind_oci::{ContainerState, HookEvent};
use raindd::api::hooks::{HOOK_EVENT_HEADER, HOOK_SETTER, HOOK_SETTER_HEADER};

const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about = "raind OCI hook helper", long_about = None)]
struct Args {
    /// Lifecycle event (createRuntime, createContainer, poststart, stopContainer, poststop)
    event: HookEvent,

    /// raindd hook listener
    #[arg(long, env = "RAIND_HOOK_ENDPOINT", default_value = "https://127.0.0.1:7756")]
    endpoint: String,

    /// SPIFFE trust domain
    #[arg(long, env = "RAIND_TRUST_DOMAIN", default_value = "raind.local")]
    trust_domain: String,

    /// State root
    #[arg(long, env = "RAIND_ROOT", default_value = "/etc/raind")]
    root: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    if std::env::var("RAIND-HOOK-SETTER").ok().as_deref() != Some(HOOK_SETTER) {
        bail!("refusing to run: not invoked by raind");
    }
    let args = Args::parse();

    let mut payload = Vec::new();
    std::io::stdin()
        .read_to_end(&mut payload)
        .wrap_err("read container state from stdin")?;
    let state: ContainerState =
        serde_json::from_slice(&payload).wrap_err("decode container state")?;

    let paths = RaindPaths::with_root(&args.root);
    let ca = std::fs::read(paths.pki().join(CA_CERT)).wrap_err("read client CA")?;
    let ca = reqwest::Certificate::from_pem(&ca).wrap_err("decode client CA")?;
    let builder = || {
        reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(ca.clone())
            .connect_timeout(TIMEOUT)
            .timeout(TIMEOUT)
    };

    let cert_dir = paths.container_subdir(&state.id, "cert");
    if args.event == HookEvent::CreateRuntime {
        enroll(&builder().build()?, &args, &state.id, &cert_dir).await?;
    }
    let client = builder().identity(identity(&cert_dir)?).build()?;

    let response = client
        .post(format!("{}/v1/hooks/droplet", args.endpoint))
        .header(HOOK_EVENT_HEADER, args.event.to_string())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(payload)
        .send()
        .await
        .wrap_err("post hook event")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("raindd rejected {} for {}: {status} {body}", args.event, state.id);
    }
    Ok(())
}

/// The container's client certificate and key.
fn identity(cert_dir: &Path) -> Result<reqwest::Identity> {
    let mut pem = std::fs::read(cert_dir.join("client.key")).wrap_err("read client key")?;
    pem.extend(std::fs::read(cert_dir.join("client.crt")).wrap_err("read client certificate")?);
    reqwest::Identity::from_pem(&pem).wrap_err("load client identity")
}

/// Request a client certificate unless both halves are already present.
async fn enroll(client: &reqwest::Client, args: &Args, id: &str, cert_dir: &Path) -> Result<()> {
    let cert_path = cert_dir.join("client.crt");
    let key_path = cert_dir.join("client.key");
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }

    let spiffe_id = SpiffeId::container(args.trust_domain.clone(), id);
    let (csr, key) = container_csr(&spiffe_id).map_err(|e| eyre!("build CSR: {e}"))?;
    let response = client
        .post(format!("{}/v1/pki/sign", args.endpoint))
        .header(HOOK_SETTER_HEADER, HOOK_SETTER)
        .header(reqwest::header::CONTENT_TYPE, "application/pem-certificate-chain")
        .body(csr)
        .send()
        .await
        .wrap_err("post CSR")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("CSR for {spiffe_id} rejected: {status} {body}");
    }
    let certificate = response.text().await?;

    std::fs::create_dir_all(cert_dir)?;
    std::fs::write(&key_path, key).wrap_err("write client key")?;
    std::fs::write(&cert_path, certificate).wrap_err("write client certificate")?;
    Ok(())
}
