//! Integration tests for the DBSS
//!
//! These tests validate cross-component interactions and real network behavior.

use dbss::config::{AppConfig, ServerConfig};
use dbss::dispatcher::Dispatcher;
use dbss::network::{Server, ServerMessage};
use dbss::store::StoreClient;
use dbss_shared::datagram::MAX_DATAGRAM_SIZE;
use dbss_shared::messages::{
    store_get_all_response, ChangingLocation, EnterLocation, QueryAllReply,
};
use dbss_shared::msgtypes::*;
use dbss_shared::{
    Channel, Datagram, DatagramIterator, DoId, FieldValue, Location, ObjectRequest, StoreRequest,
};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const DATABASE: Channel = 200;
const SHARD: Channel = 5;

const CONFIG: &str = r#"
    [router]
    bind = "127.0.0.1:0"

    [dbss]
    range_min = 9000
    range_max = 9999
    database = 200
    load_timeout_ms = 5000

    [[class]]
    id = 5
    name = "DistributedTestObject5"

    [[class.field]]
    id = 1
    name = "setRequired1"
    type = "uint32"
    required = true
    default = 78

    [[class.field]]
    id = 2
    name = "setRDB3"
    type = "uint32"
    required = true

    [[class.field]]
    id = 3
    name = "setRDbD5"
    type = "uint8"
    required = true

    [[class.field]]
    id = 4
    name = "setBR1"
    type = "string"
"#;

fn config() -> ServerConfig {
    AppConfig::from_toml(CONFIG).unwrap().validate().unwrap()
}

fn stored_fields(rdb3: u32, rdbd5: u8) -> Vec<(u16, FieldValue)> {
    vec![
        (2, FieldValue::encode(&rdb3).unwrap()),
        (3, FieldValue::encode(&rdbd5).unwrap()),
    ]
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests the byte layout of a server datagram header
    #[test]
    fn server_header_layout() {
        let dg = Datagram::server(&[9000, 9001], SHARD, STATESERVER_OBJECT_GET_ALL).unwrap();
        let bytes = dg.as_bytes();

        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..9], &9000u64.to_le_bytes());
        assert_eq!(&bytes[9..17], &9001u64.to_le_bytes());
        assert_eq!(&bytes[17..25], &SHARD.to_le_bytes());
        assert_eq!(&bytes[25..27], &STATESERVER_OBJECT_GET_ALL.to_le_bytes());
        assert_eq!(bytes.len(), 27);
    }

    /// Tests that every shard request decodes to what was sent
    #[test]
    fn object_requests_decode() {
        let requests = [
            ObjectRequest::QueryAll {
                do_id: 9000,
                requester: SHARD,
                token: 1,
            },
            ObjectRequest::SetZone {
                do_id: 9001,
                requester: SHARD,
                location: Location::new(80000, 100),
            },
            ObjectRequest::GetActivated {
                do_id: 9002,
                requester: SHARD,
                token: 3,
            },
        ];

        for request in requests {
            let dg = request.encode().unwrap();
            let mut dgi = DatagramIterator::new(dg.as_bytes());
            let header = dgi.read_header().unwrap();
            let decoded = ObjectRequest::decode(request.do_id(), &header, &mut dgi).unwrap();
            assert_eq!(decoded, Some(request));
            assert_eq!(dgi.remaining(), 0);
        }
    }

    /// Tests that datagrams cannot outgrow a UDP packet
    #[test]
    fn datagram_size_limit() {
        let mut dg = Datagram::new();
        assert_ok!(dg.add_raw(&vec![0u8; MAX_DATAGRAM_SIZE]));
        assert_err!(dg.add(&1u8));
    }

    /// Tests sentinel handling for unset locations
    #[test]
    fn invalid_location_sentinels() {
        let mut dg = Datagram::new();
        dg.add_location(None).unwrap();
        assert_eq!(dg.as_bytes(), &[0xFF; 8]);

        let mut dgi = DatagramIterator::new(dg.as_bytes());
        assert_eq!(dgi.read_location().unwrap(), None);
    }

    /// Tests that location channels keep parent and zone apart
    #[test]
    fn location_channels_are_distinct() {
        let a = Location::new(80000, 100).channel();
        let b = Location::new(80000, 101).channel();
        let c = Location::new(80001, 100).channel();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a >> 32, 80000);
    }
}

/// DISPATCHER SCENARIO TESTS
mod scenario_tests {
    use super::*;

    struct Harness {
        dispatcher: Dispatcher,
        rx: mpsc::UnboundedReceiver<Datagram>,
    }

    impl Harness {
        fn new() -> Self {
            let config = config();
            let (tx, rx) = mpsc::unbounded_channel();
            let dispatcher = Dispatcher::new(
                config.range,
                config.classes,
                StoreClient::new(config.database, 1),
                config.load_timeout,
                tx,
            );
            Self { dispatcher, rx }
        }

        fn send(&mut self, request: ObjectRequest) -> Vec<Datagram> {
            let dg = request.encode().unwrap();
            self.deliver(&dg)
        }

        fn deliver(&mut self, dg: &Datagram) -> Vec<Datagram> {
            self.dispatcher.handle_datagram(dg.as_bytes()).unwrap();
            let mut out = Vec::new();
            while let Ok(dg) = self.rx.try_recv() {
                out.push(dg);
            }
            out
        }

        fn answer(&mut self, fetch: &Datagram, found: Option<Vec<(u16, FieldValue)>>) -> Vec<Datagram> {
            let (context, do_id) = fetch_of(fetch);
            let reply = match &found {
                Some(fields) => store_get_all_response(DATABASE, do_id, context, Some((5, fields.as_slice()))),
                None => store_get_all_response(DATABASE, do_id, context, None),
            }
            .unwrap();
            self.deliver(&reply)
        }
    }

    fn fetch_of(dg: &Datagram) -> (u32, DoId) {
        let mut dgi = DatagramIterator::new(dg.as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.recipients, vec![DATABASE]);
        match StoreRequest::decode(&header, &mut dgi).unwrap() {
            Some(StoreRequest::GetAll { context, do_id }) => (context, do_id),
            other => panic!("expected a fetch, got {other:?}"),
        }
    }

    /// Query of an unloaded object loads it and answers with defaults filled in
    #[test]
    fn query_unloaded_object() {
        let mut h = Harness::new();

        let out = h.send(ObjectRequest::QueryAll {
            do_id: 9000,
            requester: SHARD,
            token: 1,
        });
        assert_eq!(out.len(), 1);
        assert_eq!(fetch_of(&out[0]).1, 9000);

        let out = h.answer(&out[0], Some(stored_fields(32144123, 23)));
        assert_eq!(out.len(), 1);

        let mut dgi = DatagramIterator::new(out[0].as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.recipients, vec![SHARD]);
        assert_eq!(header.sender, 9000);
        let reply = QueryAllReply::read(&mut dgi).unwrap();
        assert_eq!(reply.token, 1);
        assert_eq!(reply.class_id, 5);
        assert_eq!(reply.location, None);
        assert_eq!(dgi.read_u32().unwrap(), 78);
        assert_eq!(dgi.read_u32().unwrap(), 32144123);
        assert_eq!(dgi.read_u8().unwrap(), 23);
        assert_eq!(dgi.remaining(), 0);
    }

    /// Deletes unload the object; a later query reloads it and may fail quietly
    #[test]
    fn delete_then_reload() {
        let mut h = Harness::new();
        let query = |token| ObjectRequest::QueryAll {
            do_id: 9000,
            requester: SHARD,
            token,
        };

        let fetch = h.send(query(1));
        h.answer(&fetch[0], Some(stored_fields(32144123, 23)));

        assert!(h
            .send(ObjectRequest::DeleteRam {
                do_id: 9000,
                requester: SHARD
            })
            .is_empty());

        let out = h.send(ObjectRequest::DeleteDisk {
            do_id: 9000,
            requester: SHARD,
        });
        assert_eq!(out.len(), 1);
        let mut dgi = DatagramIterator::new(out[0].as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.msg_type, DBSERVER_OBJECT_DELETE);
        assert_eq!(dgi.read_u32().unwrap(), 9000);

        let refetch = h.send(query(2));
        assert_eq!(refetch.len(), 1);
        assert_ne!(fetch_of(&fetch[0]).0, fetch_of(&refetch[0]).0);

        assert!(h.answer(&refetch[0], None).is_empty());
    }

    /// Placing and moving an object broadcasts to the right locations
    #[test]
    fn set_zone_broadcasts() {
        let mut h = Harness::new();
        let set_zone = |zone| ObjectRequest::SetZone {
            do_id: 9001,
            requester: SHARD,
            location: Location::new(80000, zone),
        };

        let fetch = h.send(set_zone(100));
        let out = h.answer(&fetch[0], Some(stored_fields(3117, 97)));
        assert_eq!(out.len(), 1);

        let mut dgi = DatagramIterator::new(out[0].as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.recipients, vec![Location::new(80000, 100).channel()]);
        let enter = EnterLocation::read(&mut dgi).unwrap();
        assert_eq!(enter.do_id, 9001);
        assert_eq!(enter.class_id, 5);
        assert_eq!(dgi.read_u32().unwrap(), 78);
        assert_eq!(dgi.read_u32().unwrap(), 3117);
        assert_eq!(dgi.read_u8().unwrap(), 97);

        let out = h.send(set_zone(101));
        assert_eq!(out.len(), 2);

        let mut dgi = DatagramIterator::new(out[0].as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.recipients, vec![Location::new(80000, 100).channel()]);
        assert_eq!(header.msg_type, STATESERVER_OBJECT_CHANGING_LOCATION);
        assert_eq!(
            ChangingLocation::read(&mut dgi).unwrap(),
            ChangingLocation {
                do_id: 9001,
                new_location: Location::new(80000, 101),
                old_location: Location::new(80000, 100),
            }
        );

        let mut dgi = DatagramIterator::new(out[1].as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.recipients, vec![Location::new(80000, 101).channel()]);
        assert_eq!(
            EnterLocation::read(&mut dgi).unwrap().location,
            Location::new(80000, 101)
        );
    }

    /// Objects without a location never broadcast
    #[test]
    fn no_location_no_broadcast() {
        let mut h = Harness::new();
        let fetch = h.send(ObjectRequest::QueryAll {
            do_id: 9002,
            requester: SHARD,
            token: 1,
        });
        let out = h.answer(&fetch[0], Some(stored_fields(1, 2)));
        assert_eq!(out.len(), 1);

        let out = h.send(ObjectRequest::DeleteDisk {
            do_id: 9002,
            requester: SHARD,
        });
        assert_eq!(out.len(), 1, "only the database delete");
        let mut dgi = DatagramIterator::new(out[0].as_bytes());
        assert_eq!(dgi.read_header().unwrap().recipients, vec![DATABASE]);
    }
}

/// REAL NETWORK TESTS
mod network_tests {
    use super::*;

    async fn recv(router: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), router.recv_from(&mut buf))
            .await
            .expect("timed out waiting for the DBSS")
            .unwrap();
        buf.truncate(len);
        buf
    }

    fn header_of(data: &[u8]) -> (dbss_shared::DatagramHeader, usize) {
        let mut dgi = DatagramIterator::new(data);
        let header = dgi.read_header().unwrap();
        (header, dgi.offset())
    }

    /// Full round trip through a fake router that also plays the database
    #[tokio::test]
    async fn query_and_move_over_udp() {
        let router = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = config();
        config.router_address = router.local_addr().unwrap();

        let mut server = Server::new(&config, 77).await.unwrap();
        let dbss_addr = server.local_addr().unwrap();
        let control = server.control_sender();
        let task = tokio::spawn(async move { server.run().await });

        // range subscription comes first
        let subscribe = recv(&router).await;
        let mut dgi = DatagramIterator::new(&subscribe);
        assert_eq!(dgi.read_u8().unwrap(), 1);
        dgi.read_u64().unwrap();
        assert_eq!(dgi.read_u16().unwrap(), CONTROL_ADD_RANGE);

        let query = ObjectRequest::QueryAll {
            do_id: 9000,
            requester: SHARD,
            token: 11,
        };
        router
            .send_to(query.encode().unwrap().as_bytes(), dbss_addr)
            .await
            .unwrap();

        let fetch = recv(&router).await;
        let (header, offset) = header_of(&fetch);
        assert_eq!(header.recipients, vec![DATABASE]);
        assert_eq!(header.msg_type, DBSERVER_OBJECT_GET_ALL);
        let mut dgi = DatagramIterator::new(&fetch[offset..]);
        let context = dgi.read_u32().unwrap();
        assert_eq!(context, 77, "the first context is the seed");
        assert_eq!(dgi.read_u32().unwrap(), 9000);

        let fields = stored_fields(32144123, 23);
        let reply = store_get_all_response(DATABASE, 9000, context, Some((5, &fields[..]))).unwrap();
        router.send_to(reply.as_bytes(), dbss_addr).await.unwrap();

        let answer = recv(&router).await;
        let (header, offset) = header_of(&answer);
        assert_eq!(header.recipients, vec![SHARD]);
        assert_eq!(header.msg_type, STATESERVER_OBJECT_GET_ALL_RESP);
        let mut dgi = DatagramIterator::new(&answer[offset..]);
        assert_eq!(QueryAllReply::read(&mut dgi).unwrap().token, 11);

        let set_zone = ObjectRequest::SetZone {
            do_id: 9000,
            requester: SHARD,
            location: Location::new(80000, 100),
        };
        router
            .send_to(set_zone.encode().unwrap().as_bytes(), dbss_addr)
            .await
            .unwrap();

        let enter = recv(&router).await;
        let (header, _) = header_of(&enter);
        assert_eq!(header.recipients, vec![Location::new(80000, 100).channel()]);
        assert_eq!(header.msg_type, STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED);

        control.send(ServerMessage::Shutdown).unwrap();
        let unsubscribe = recv(&router).await;
        let mut dgi = DatagramIterator::new(&unsubscribe);
        dgi.read_u8().unwrap();
        dgi.read_u64().unwrap();
        assert_eq!(dgi.read_u16().unwrap(), CONTROL_REMOVE_RANGE);

        assert_ok!(task.await.unwrap());
    }

    /// Garbage from the router is dropped without taking the server down
    #[tokio::test]
    async fn malformed_datagrams_are_survived() {
        let router = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = config();
        config.router_address = router.local_addr().unwrap();

        let mut server = Server::new(&config, 1).await.unwrap();
        let dbss_addr = server.local_addr().unwrap();
        let control = server.control_sender();
        let task = tokio::spawn(async move { server.run().await });
        recv(&router).await;

        router.send_to(&[0xFF, 0x00, 0x01], dbss_addr).await.unwrap();

        let ask = ObjectRequest::GetActivated {
            do_id: 9000,
            requester: SHARD,
            token: 4,
        };
        router
            .send_to(ask.encode().unwrap().as_bytes(), dbss_addr)
            .await
            .unwrap();

        let answer = recv(&router).await;
        let (header, offset) = header_of(&answer);
        assert_eq!(header.msg_type, DBSS_OBJECT_GET_ACTIVATED_RESP);
        let mut dgi = DatagramIterator::new(&answer[offset..]);
        assert_eq!(dgi.read_u32().unwrap(), 4);
        assert_eq!(dgi.read_u32().unwrap(), 9000);
        assert!(!dgi.read_bool().unwrap());

        control.send(ServerMessage::Shutdown).unwrap();
        recv(&router).await;
        assert_ok!(task.await.unwrap());
    }
}
