#[allow(clippy::expect_used)] // The kube client cannot talk TLS without a provider
pub fn init_crypto() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");
}
