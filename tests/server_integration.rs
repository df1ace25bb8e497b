//! End-to-end tests against a running server over real TCP connections

use std::net::SocketAddr;
use std::time::Duration;

use relay_chat::{ChatServer, Config, ServerHandle, ServerState};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn start(config: Config) -> (SocketAddr, ServerHandle, tokio::task::JoinHandle<()>) {
    let config = Config {
        port: free_port(),
        logging: false,
        ..config
    };
    let mut server = ChatServer::new(config).unwrap();
    let addr = server.bind().unwrap();
    let handle = server.handle();
    let task = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    handle.wait_for(ServerState::Open).await;
    (addr, handle, task)
}

struct Client {
    id: u64,
    stream: BufReader<TcpStream>,
}

impl Client {
    /// Connect and consume the WELCOME frame
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Self {
            id: 0,
            stream: BufReader::new(stream),
        };
        let welcome = client.recv().await;
        client.id = welcome
            .strip_prefix("WELCOME:")
            .unwrap_or_else(|| panic!("expected WELCOME, got {welcome:?}"))
            .parse()
            .unwrap();
        client
    }

    async fn send(&mut self, line: &str) {
        self.stream
            .get_mut()
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next line without its terminator; empty string on EOF
    async fn recv(&mut self) -> String {
        let mut line = String::new();
        timeout(READ_TIMEOUT, self.stream.read_line(&mut line))
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        line.trim_end_matches('\n').to_string()
    }

    async fn expect_closed(&mut self) {
        assert_eq!(self.recv().await, "");
    }
}

/// SCENARIO TESTS
mod scenario_tests {
    use super::*;

    /// Three clients; the first names itself and broadcasts
    #[tokio::test]
    async fn three_clients_broadcast() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut c1 = Client::connect(addr).await;
        let mut c2 = Client::connect(addr).await;
        let mut c3 = Client::connect(addr).await;

        c1.send("USERNAME:alice").await;
        assert_eq!(c1.recv().await, "OK:username set to alice");
        c1.send("MSG:hello").await;

        let expected = format!("MSG:{}:alice:hello", c1.id);
        assert_eq!(c2.recv().await, expected);
        assert_eq!(c3.recv().await, expected);

        // c1's next frame is its USERS reply, not its own message
        c1.send("USERS").await;
        assert_eq!(
            c1.recv().await,
            format!("USERS:{}=alice,{}=,{}=", c1.id, c2.id, c3.id)
        );

        handle.shutdown();
        task.await.unwrap();
    }

    /// Every other session receives a broadcast exactly once
    #[tokio::test]
    async fn broadcast_exactly_once() {
        let (addr, handle, task) = start(Config {
            max_users: 10,
            ..Config::default()
        })
        .await;

        let mut clients = Vec::new();
        for _ in 0..6 {
            clients.push(Client::connect(addr).await);
        }
        let sender_id = clients[0].id;
        clients[0].send("MSG:ping").await;
        clients[0].send("MSG:pong").await;

        for client in clients.iter_mut().skip(1) {
            assert_eq!(client.recv().await, format!("MSG:{sender_id}:anonymous:ping"));
            assert_eq!(client.recv().await, format!("MSG:{sender_id}:anonymous:pong"));
        }

        clients[0].send("DUMP").await;
        assert_eq!(clients[0].recv().await, format!("DUMP:{sender_id}:anonymous:ping"));
        assert_eq!(clients[0].recv().await, format!("DUMP:{sender_id}:anonymous:pong"));
        assert_eq!(clients[0].recv().await, "OK:dumped 2 messages");

        handle.shutdown();
        task.await.unwrap();
    }

    /// A direct message reaches only its target
    #[tokio::test]
    async fn direct_message() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut a = Client::connect(addr).await;
        let mut b = Client::connect(addr).await;
        let mut c = Client::connect(addr).await;

        a.send(&format!("DM:{}:just you", b.id)).await;
        assert_eq!(b.recv().await, format!("DM:{}:anonymous:just you", a.id));

        a.send("DM:999:hello?").await;
        assert!(a.recv().await.starts_with("ERROR:no_such_user:"));

        c.send("USERS").await;
        assert!(c.recv().await.starts_with("USERS:"));

        handle.shutdown();
        task.await.unwrap();
    }
}

/// FAULT ISOLATION TESTS
mod isolation_tests {
    use super::*;

    /// An unknown header closes only the sender
    #[tokio::test]
    async fn unknown_header_closes_only_sender() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut bad = Client::connect(addr).await;
        let mut good = Client::connect(addr).await;
        let mut other = Client::connect(addr).await;

        bad.send("NOT_A_COMMAND:x").await;
        assert!(bad.recv().await.starts_with("ERROR:unknown_header:"));
        assert_eq!(bad.recv().await, "BYE:protocol error");
        bad.expect_closed().await;

        good.send("MSG:still alive").await;
        assert_eq!(
            other.recv().await,
            format!("MSG:{}:anonymous:still alive", good.id)
        );
        other.send("MSG:me too").await;
        assert_eq!(good.recv().await, format!("MSG:{}:anonymous:me too", other.id));

        handle.shutdown();
        task.await.unwrap();
    }

    /// A second USERNAME is refused and the first one stays
    #[tokio::test]
    async fn username_set_once() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut a = Client::connect(addr).await;
        let mut b = Client::connect(addr).await;

        a.send("USERNAME:alice").await;
        assert_eq!(a.recv().await, "OK:username set to alice");
        a.send("USERNAME:eve").await;
        assert!(a.recv().await.starts_with("ERROR:already_set:"));

        a.send("MSG:who am i").await;
        assert_eq!(b.recv().await, format!("MSG:{}:alice:who am i", a.id));

        handle.shutdown();
        task.await.unwrap();
    }

    /// A client that stops reading neither stalls a broadcaster nor survives a KICK
    #[tokio::test]
    async fn stalled_recipient_is_skipped() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut a = Client::connect(addr).await;

        // small receive buffer, never read from
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let _stalled = socket.connect(addr).await.unwrap();
        let stalled_id = a.id + 1;

        let mut c = Client::connect(addr).await;

        // far more than the stalled client's socket buffers and queue hold
        let text = "x".repeat(3000);
        for n in 0..2000 {
            a.send(&format!("MSG:{n}:{text}")).await;
            assert_eq!(
                c.recv().await,
                format!("MSG:{}:anonymous:{n}:{text}", a.id),
                "broadcast {n} did not arrive"
            );
        }

        c.send(&format!("KICK:{stalled_id}")).await;
        assert_eq!(c.recv().await, format!("OK:kicked {stalled_id}"));

        a.send("MSG:after").await;
        assert_eq!(c.recv().await, format!("MSG:{}:anonymous:after", a.id));
        c.send("USERS").await;
        assert_eq!(c.recv().await, format!("USERS:{}=,{}=", a.id, c.id));

        handle.shutdown();
        timeout(READ_TIMEOUT, task).await.unwrap().unwrap();
    }

    /// Refused peers that never read do not hold up other connections
    #[tokio::test]
    async fn refusals_do_not_block_accept() {
        let (addr, handle, task) = start(Config {
            max_users: 1,
            ..Config::default()
        })
        .await;
        let mut first = Client::connect(addr).await;

        let mut refused = Vec::new();
        for _ in 0..5 {
            refused.push(TcpStream::connect(addr).await.unwrap());
        }

        first.send("USERS").await;
        assert_eq!(first.recv().await, format!("USERS:{}=", first.id));

        for stream in refused {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            timeout(READ_TIMEOUT, reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            assert!(line.starts_with("ERROR:server_full:"));
        }

        handle.shutdown();
        task.await.unwrap();
    }

    /// Sessions beyond max_users are refused without registration
    #[tokio::test]
    async fn server_full() {
        let (addr, handle, task) = start(Config {
            max_users: 1,
            ..Config::default()
        })
        .await;
        let mut first = Client::connect(addr).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut second = BufReader::new(stream);
        let mut line = String::new();
        timeout(READ_TIMEOUT, second.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert!(line.starts_with("ERROR:server_full:"));

        first.send("USERS").await;
        assert_eq!(first.recv().await, format!("USERS:{}=", first.id));

        handle.shutdown();
        task.await.unwrap();
    }
}

/// ADMIN COMMAND TESTS
mod admin_tests {
    use super::*;

    /// KICK removes an existing session and fails on a missing one
    #[tokio::test]
    async fn kick() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut admin = Client::connect(addr).await;
        let mut target = Client::connect(addr).await;

        admin.send(&format!("KICK:{}", target.id)).await;
        assert_eq!(admin.recv().await, format!("OK:kicked {}", target.id));
        assert_eq!(target.recv().await, format!("BYE:kicked by {}", admin.id));
        target.expect_closed().await;

        admin.send(&format!("KICK:{}", target.id)).await;
        assert!(admin.recv().await.starts_with("ERROR:no_such_user:"));

        admin.send("USERS").await;
        assert_eq!(admin.recv().await, format!("USERS:{}=", admin.id));

        handle.shutdown();
        task.await.unwrap();
    }

    /// BAN closes the target and refuses its address afterwards
    #[tokio::test]
    async fn ban_refuses_address() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut admin = Client::connect(addr).await;
        let mut target = Client::connect(addr).await;

        admin.send(&format!("BAN:{}", target.id)).await;
        assert_eq!(admin.recv().await, format!("OK:banned {}", target.id));
        assert_eq!(target.recv().await, format!("BYE:banned by {}", admin.id));
        target.expect_closed().await;

        // everything here connects from 127.0.0.1
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut refused = BufReader::new(stream);
        let mut line = String::new();
        timeout(READ_TIMEOUT, refused.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert!(line.starts_with("ERROR:banned:"));

        // already-connected sessions are unaffected
        admin.send("USERS").await;
        assert_eq!(admin.recv().await, format!("USERS:{}=", admin.id));

        handle.shutdown();
        task.await.unwrap();
    }

    /// QUIT closes only the sender
    #[tokio::test]
    async fn quit() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut a = Client::connect(addr).await;
        let mut b = Client::connect(addr).await;

        a.send("QUIT").await;
        assert_eq!(a.recv().await, "BYE:goodbye");
        a.expect_closed().await;

        b.send("USERS").await;
        assert_eq!(b.recv().await, format!("USERS:{}=", b.id));

        handle.shutdown();
        task.await.unwrap();
    }

    /// KILL closes every session and stops accepting
    #[tokio::test]
    async fn kill_shuts_down() {
        let (addr, handle, task) = start(Config::default()).await;
        let mut a = Client::connect(addr).await;
        let mut b = Client::connect(addr).await;

        a.send("KILL").await;
        assert_eq!(a.recv().await, "OK:server shutting down");
        assert_eq!(a.recv().await, "BYE:server shutting down");
        a.expect_closed().await;
        assert_eq!(b.recv().await, "BYE:server shutting down");
        b.expect_closed().await;

        task.await.unwrap();
        assert_eq!(handle.state(), ServerState::Closed);
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
