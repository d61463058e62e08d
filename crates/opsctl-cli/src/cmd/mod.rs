pub mod access;
pub mod config;
pub mod env;
pub mod ip;
pub mod rules;

/// Single-threaded runtime; a reconcile never runs groups concurrently.
pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

/// Label for this invocation: `--label`, else `sshUser` from config.
pub(crate) fn label<'a>(explicit: Option<&'a str>, config: &'a opsctl_core::config::Config) -> &'a str {
    explicit.unwrap_or(config.ssh_user.as_str())
}
