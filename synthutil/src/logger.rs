/// Intercept messages using the `log` crate and print them to STDERR. The default level is
/// `info`; override it with `RUST_LOG`.
///
/// Calling this more than once is harmless, so tests and binaries can both call it.
pub fn setup() {
    use env_logger::{Builder, Env};
    let _ = Builder::from_env(Env::default().default_filter_or("info")).try_init();
}
