use std::{sync::OnceLock, time::Duration};

use tracing::debug;

/// Idle connections kept per host; uploads hit the same Graph host repeatedly.
const POOL_MAX_IDLE_PER_HOST: usize = 10;

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared HTTP client.
///
/// `request_timeout` is the default; individual requests override it.
pub fn build_client(request_timeout: Duration) -> crate::Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("reels-relay/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .tcp_keepalive(TCP_KEEPALIVE)
        .connect_timeout(Duration::from_secs(30));

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    Ok(builder.build()?)
}
