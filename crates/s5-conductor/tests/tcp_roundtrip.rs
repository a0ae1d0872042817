//! End-to-end tests: failover client over TCP against served simulated conductors.

use std::sync::Arc;
use std::time::Duration;

use s5_conductor::sim::{DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD};
use s5_conductor::{
    ClientError, ConductorClient, ConductorClientConfig, ConductorServer, ErrorKind, Executor,
    PoolConfig, Quota, Request, Response, RetryConfig, SimCluster, TcpConductorTransport,
};

struct Served {
    cluster: SimCluster,
    servers: Vec<ConductorServer>,
}

impl Served {
    async fn start(ids: &[&str]) -> Self {
        let cluster = SimCluster::new(ids);
        let mut servers = Vec::new();
        for id in ids {
            let server = ConductorServer::bind("127.0.0.1:0", Arc::new(cluster.service(id)))
                .await
                .unwrap();
            servers.push(server);
        }
        Self { cluster, servers }
    }

    fn addrs(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|s| s.local_addr().to_string())
            .collect()
    }
}

fn client() -> ConductorClient {
    let config = ConductorClientConfig {
        retry: RetryConfig {
            max_attempts: 1,
            jitter: false,
            ..RetryConfig::default()
        },
        request_timeout: Duration::from_millis(300),
        call_timeout: Duration::from_secs(5),
        pool: PoolConfig {
            connect_timeout: Duration::from_millis(300),
            ..PoolConfig::default()
        },
        ..ConductorClientConfig::default()
    };
    ConductorClient::new(Arc::new(TcpConductorTransport::default()), config)
}

fn admin() -> Executor {
    Executor::new(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD)
}

#[tokio::test]
async fn test_tenant_lifecycle_over_tcp() {
    let served = Served::start(&["10.0.0.1", "10.0.0.2"]).await;
    let client = client();
    let addrs = served.addrs();

    client
        .call(
            &addrs,
            &admin(),
            Request::CreateTenant {
                name: "acme".to_string(),
                password: "pw".to_string(),
                quota: Quota::new(1 << 30, 1000, 1 << 20),
            },
            None,
        )
        .await
        .unwrap();

    let out = client
        .call(
            &addrs,
            &admin(),
            Request::StatTenant {
                name: "acme".to_string(),
            },
            None,
        )
        .await
        .unwrap();
    match out.response {
        Response::Tenant(t) => assert_eq!(t.quota.capacity, 1 << 30),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.metrics().connections_opened, 1);
}

#[tokio::test]
async fn test_failover_when_server_is_gone() {
    let mut served = Served::start(&["10.0.0.1", "10.0.0.2"]).await;
    let addrs = served.addrs();
    let first = served.servers.remove(0);
    first.shutdown();
    first.wait().await;

    let client = client();
    let out = client
        .call(&addrs, &admin(), Request::ListStores, None)
        .await
        .unwrap();
    assert_eq!(out.conductor, addrs[1]);
    assert_eq!(client.metrics().failovers, 1);
}

#[tokio::test]
async fn test_silent_conductor_times_out_then_fails_over() {
    let served = Served::start(&["10.0.0.1", "10.0.0.2"]).await;
    served.cluster.stop("10.0.0.1");
    let client = client();
    let out = client
        .call(&served.addrs(), &admin(), Request::ListStores, None)
        .await
        .unwrap();
    assert_eq!(out.conductor, served.addrs()[1]);
    assert!(client.metrics().timeouts >= 1);
}

#[tokio::test]
async fn test_remote_rejection_over_tcp() {
    let served = Served::start(&["10.0.0.1"]).await;
    let client = client();
    let err = client
        .call(
            &served.addrs(),
            &Executor::new("nobody", "bad"),
            Request::Login,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(matches!(err, ClientError::Rejected { .. }));
}
