use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

#[allow(unused)]
pub const BASE_URL: &str = "http://127.0.0.1:3003";

/// Install a tracing subscriber and start the in-process mock service.
///
/// The service runs on its own runtime thread so it outlives any single
/// `#[tokio::test]` runtime.
#[allow(unused)]
pub async fn init() {
    static ONCE_LOCK: OnceLock<()> = OnceLock::new();

    let wait = ONCE_LOCK.get().is_none();

    ONCE_LOCK.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("surge=debug,mock_service=debug")
            .try_init();

        std::thread::spawn(|| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("mock service runtime");
            rt.block_on(async {
                let addr: SocketAddr = "127.0.0.1:3003".parse().unwrap();
                mock_service::run(addr).await;
            });
        });
    });

    if wait {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
