#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::query::SessionSettings;
    use crate::registry::ProcessTable;
    use crate::server::{handle_connection, ServerOptions};
    use crate::session::SessionOutcome;
    use async_trait::async_trait;
    use pgsession_core::{Charset, DataBackend, QueryResult};
    use pgsession_protocol::MessageBuilder;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        fn push(&self, call: String) {
            self.0.lock().unwrap().push(call);
        }

        fn all(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.all().iter().filter(|c| c.as_str() == call).count()
        }
    }

    /// Records every call; users other than "fred" log in without a password.
    struct RecordingBackend {
        calls: Calls,
    }

    #[async_trait]
    impl DataBackend for RecordingBackend {
        async fn set_user(&mut self, name: &str) -> bool {
            self.calls.push(format!("user:{name}"));
            name != "fred"
        }

        async fn set_database(&mut self, name: &str) -> bool {
            self.calls.push(format!("database:{name}"));
            name != "missing"
        }

        async fn set_password(&mut self, password: &str) -> bool {
            self.calls.push(format!("password:{password}"));
            password == "secret"
        }

        async fn get_result(&mut self, sql: &str) -> QueryResult {
            self.calls.push(format!("sql:{sql}"));
            let row = |cells: &[&str]| cells.iter().map(|c| Some(c.to_string())).collect();
            if sql == "select * from t" {
                QueryResult::select(
                    vec!["c1".into(), "c2".into()],
                    vec![row(&["1", "2"]), row(&["3", "4"])],
                )
            } else if sql == "select * from big" {
                QueryResult::select(
                    vec!["n".into()],
                    (1..=5).map(|i| vec![Some(i.to_string())]),
                )
            } else if sql == "select pr\u{e9}nom" {
                QueryResult::select(vec!["pr\u{e9}nom".into()], vec![row(&["x"])])
            } else if sql.starts_with("select pg_sleep") {
                std::future::pending::<()>().await;
                unreachable!()
            } else if sql == "select name" {
                QueryResult::select(
                    vec!["name".into(), "nickname".into()],
                    vec![vec![Some("caf\u{e9}".into()), None]],
                )
            } else if sql.starts_with("delete") {
                QueryResult::Delete { rows: 1 }
            } else if sql.starts_with("create") {
                QueryResult::Create { rows: 4 }
            } else {
                QueryResult::error(format!("syntax error at or near \"{sql}\""))
            }
        }
    }

    struct Client {
        stream: DuplexStream,
    }

    impl Client {
        async fn send(&mut self, tag: u8, build: impl FnOnce(&mut MessageBuilder)) {
            let mut builder = MessageBuilder::new(Some(tag));
            build(&mut builder);
            let frame = builder.finish().expect("frame");
            self.stream.write_all(&frame).await.expect("send");
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.expect("send");
        }

        async fn startup(&mut self, params: &[(&str, &str)]) {
            let mut builder = MessageBuilder::new(None);
            builder.put_i32(196608).unwrap();
            for (key, value) in params {
                builder.put_cstring(key).unwrap();
                builder.put_cstring(value).unwrap();
            }
            builder.put_u8(0).unwrap();
            let frame = builder.finish().expect("frame");
            self.send_raw(&frame).await;
        }

        async fn recv(&mut self) -> (u8, Vec<u8>) {
            let tag = self.stream.read_u8().await.expect("tag");
            let len = self.stream.read_i32().await.expect("len");
            let mut body = vec![0u8; len as usize - 4];
            self.stream.read_exact(&mut body).await.expect("body");
            (tag, body)
        }

        /// Messages up to and including ReadyForQuery, ParameterStatus skipped.
        async fn until_ready(&mut self) -> Vec<(u8, Vec<u8>)> {
            let mut seen = Vec::new();
            loop {
                let (tag, body) = self.recv().await;
                if tag == b'S' {
                    continue;
                }
                seen.push((tag, body));
                if tag == b'Z' {
                    return seen;
                }
            }
        }

        async fn query(&mut self, sql: &str) -> Vec<(u8, Vec<u8>)> {
            self.send(b'Q', |b| b.put_cstring(sql).unwrap()).await;
            self.until_ready().await
        }

        async fn parse(&mut self, name: &str, sql: &str) {
            self.send(b'P', |b| {
                b.put_cstring(name).unwrap();
                b.put_cstring(sql).unwrap();
                b.put_i16(0).unwrap();
            })
            .await;
        }

        async fn bind(&mut self, portal: &str, statement: &str, params: &[&str]) {
            self.bind_with(portal, statement, &[], params, &[]).await;
        }

        async fn bind_with(
            &mut self,
            portal: &str,
            statement: &str,
            formats: &[i16],
            params: &[&str],
            result_formats: &[i16],
        ) {
            self.send(b'B', |b| {
                b.put_cstring(portal).unwrap();
                b.put_cstring(statement).unwrap();
                b.put_i16(formats.len() as i16).unwrap();
                for f in formats {
                    b.put_i16(*f).unwrap();
                }
                b.put_i16(params.len() as i16).unwrap();
                for p in params {
                    b.put_i32(p.len() as i32).unwrap();
                    b.put_bytes(p.as_bytes()).unwrap();
                }
                b.put_i16(result_formats.len() as i16).unwrap();
                for f in result_formats {
                    b.put_i16(*f).unwrap();
                }
            })
            .await;
        }

        async fn execute(&mut self, portal: &str, max_rows: i32) {
            self.send(b'E', |b| {
                b.put_cstring(portal).unwrap();
                b.put_i32(max_rows).unwrap();
            })
            .await;
        }

        async fn sync(&mut self) -> Vec<(u8, Vec<u8>)> {
            self.send(b'S', |_| {}).await;
            self.until_ready().await
        }

        async fn read_to_end(&mut self) -> Vec<u8> {
            let mut rest = Vec::new();
            self.stream.read_to_end(&mut rest).await.expect("read");
            rest
        }
    }

    struct Harness {
        calls: Calls,
        processes: Arc<ProcessTable>,
        options: ServerOptions,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                calls: Calls::default(),
                processes: Arc::new(ProcessTable::new()),
                options: ServerOptions {
                    session: Arc::new(SessionSettings::default()),
                    ..ServerOptions::default()
                },
            }
        }

        fn connect(&self) -> (Client, JoinHandle<Option<SessionOutcome>>) {
            self.connect_sized(64 * 1024)
        }

        /// `capacity` bounds the bytes in flight each way.
        fn connect_sized(&self, capacity: usize) -> (Client, JoinHandle<Option<SessionOutcome>>) {
            let (client, server) = tokio::io::duplex(capacity);
            let backend = RecordingBackend {
                calls: self.calls.clone(),
            };
            let handle = tokio::spawn(handle_connection(
                server,
                "test".into(),
                self.processes.clone(),
                self.options.clone(),
                backend,
            ));
            (Client { stream: client }, handle)
        }

        /// Logs in a user that needs no password; returns pid and secret key.
        async fn login(&self) -> (Client, JoinHandle<Option<SessionOutcome>>, i32, i32) {
            self.login_sized(64 * 1024).await
        }

        async fn login_sized(
            &self,
            capacity: usize,
        ) -> (Client, JoinHandle<Option<SessionOutcome>>, i32, i32) {
            let (mut client, handle) = self.connect_sized(capacity);
            client.startup(&[("user", "alice"), ("database", "test")]).await;
            let seen = client.until_ready().await;
            let key_data = seen.iter().find(|(tag, _)| *tag == b'K').expect("key data");
            let pid = i32::from_be_bytes(key_data.1[0..4].try_into().unwrap());
            let key = i32::from_be_bytes(key_data.1[4..8].try_into().unwrap());
            (client, handle, pid, key)
        }
    }

    fn cancel_packet(pid: i32, key: i32) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&16i32.to_be_bytes());
        packet.extend_from_slice(&80877102i32.to_be_bytes());
        packet.extend_from_slice(&pid.to_be_bytes());
        packet.extend_from_slice(&key.to_be_bytes());
        packet
    }

    /// Writes `count` simple queries without ever reading a reply.
    fn flood_queries(
        mut stream: tokio::io::WriteHalf<DuplexStream>,
        count: usize,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut builder = MessageBuilder::new(Some(b'Q'));
            builder.put_cstring("select * from t").unwrap();
            let frame = builder.finish().expect("frame");
            for _ in 0..count {
                if stream.write_all(&frame).await.is_err() {
                    break;
                }
            }
        })
    }

    fn tags(messages: &[(u8, Vec<u8>)]) -> String {
        messages.iter().map(|(tag, _)| *tag as char).collect()
    }

    fn cstr(body: &[u8]) -> String {
        let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
        String::from_utf8(body[..end].to_vec()).unwrap()
    }

    fn error_field(body: &[u8], code: u8) -> String {
        let mut pos = 0;
        while body[pos] != 0 {
            let field = body[pos];
            let value = cstr(&body[pos + 1..]);
            pos += 1 + value.len() + 1;
            if field == code {
                return value;
            }
        }
        panic!("no field {:?}", code as char);
    }

    fn data_row(body: &[u8]) -> Vec<Option<Vec<u8>>> {
        let count = i16::from_be_bytes([body[0], body[1]]);
        let mut pos = 2;
        let mut cells = Vec::new();
        for _ in 0..count {
            let len = i32::from_be_bytes(body[pos..pos + 4].try_into().unwrap());
            pos += 4;
            if len < 0 {
                cells.push(None);
            } else {
                cells.push(Some(body[pos..pos + len as usize].to_vec()));
                pos += len as usize;
            }
        }
        cells
    }

    #[tokio::test]
    async fn password_login_sequence() {
        let harness = Harness::new();
        let (mut client, handle) = harness.connect();
        client.startup(&[("user", "fred"), ("database", "test")]).await;
        let (tag, body) = client.recv().await;
        assert_eq!((tag, body), (b'R', vec![0, 0, 0, 3]));

        client.send(b'p', |b| b.put_cstring("secret").unwrap()).await;
        let seen = client.until_ready().await;
        assert_eq!(tags(&seen), "RKZ");
        assert_eq!(seen[0].1, vec![0, 0, 0, 0]);
        assert_eq!(seen[2].1, vec![b'I']);
        assert_eq!(
            harness.calls.all(),
            vec!["user:fred", "password:secret", "database:test"]
        );

        client.send(b'X', |_| {}).await;
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::Terminated));
    }

    #[tokio::test]
    async fn login_reports_parameter_status() {
        let harness = Harness::new();
        let (mut client, _handle) = harness.connect();
        client.startup(&[("user", "alice")]).await;
        let mut params = Vec::new();
        loop {
            let (tag, body) = client.recv().await;
            match tag {
                b'S' => params.push(cstr(&body)),
                b'Z' => break,
                _ => {}
            }
        }
        assert!(params.contains(&"server_version".to_string()));
        assert!(params.contains(&"client_encoding".to_string()));
        // no database parameter means the user name is used
        assert!(harness.calls.all().contains(&"database:alice".to_string()));
    }

    #[tokio::test]
    async fn wrong_password_is_fatal() {
        let harness = Harness::new();
        let (mut client, handle) = harness.connect();
        client.startup(&[("user", "fred")]).await;
        client.recv().await;
        client.send(b'p', |b| b.put_cstring("guess").unwrap()).await;
        let (tag, body) = client.recv().await;
        assert_eq!(tag, b'E');
        assert_eq!(error_field(&body, b'S'), "FATAL");
        assert_eq!(error_field(&body, b'C'), "28P01");
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::NotAuthenticated));
    }

    #[tokio::test]
    async fn unknown_database_and_missing_user_rejected() {
        let harness = Harness::new();
        let (mut client, handle) = harness.connect();
        client.startup(&[("user", "alice"), ("database", "missing")]).await;
        let (tag, body) = client.recv().await;
        assert_eq!(tag, b'E');
        assert_eq!(error_field(&body, b'C'), "3D000");
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::NotAuthenticated));

        let (mut client, handle) = harness.connect();
        client.startup(&[("database", "test")]).await;
        let (tag, body) = client.recv().await;
        assert_eq!(tag, b'E');
        assert_eq!(error_field(&body, b'C'), "28000");
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::NotAuthenticated));
    }

    #[tokio::test]
    async fn encryption_requests_refused_then_startup_continues() {
        let harness = Harness::new();
        let (mut client, _handle) = harness.connect();
        let mut request = Vec::new();
        request.extend_from_slice(&8i32.to_be_bytes());
        request.extend_from_slice(&80877103i32.to_be_bytes());
        client.send_raw(&request).await;
        assert_eq!(client.stream.read_u8().await.unwrap(), b'N');

        let mut request = Vec::new();
        request.extend_from_slice(&8i32.to_be_bytes());
        request.extend_from_slice(&80877104i32.to_be_bytes());
        client.send_raw(&request).await;
        assert_eq!(client.stream.read_u8().await.unwrap(), b'N');

        client.startup(&[("user", "alice")]).await;
        let seen = client.until_ready().await;
        assert_eq!(tags(&seen), "RKZ");
    }

    #[tokio::test]
    async fn unsupported_protocol_version_is_fatal() {
        let harness = Harness::new();
        let (mut client, handle) = harness.connect();
        let mut packet = Vec::new();
        packet.extend_from_slice(&9i32.to_be_bytes());
        packet.extend_from_slice(&131072i32.to_be_bytes());
        packet.push(0);
        client.send_raw(&packet).await;
        let (tag, body) = client.recv().await;
        assert_eq!(tag, b'E');
        assert_eq!(error_field(&body, b'S'), "FATAL");
        assert_eq!(error_field(&body, b'C'), "08P01");
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn simple_select_streams_rows() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        let seen = client.query("select * from t").await;
        assert_eq!(tags(&seen), "TDDCZ");
        let fields = &seen[0].1;
        assert_eq!(i16::from_be_bytes([fields[0], fields[1]]), 2);
        assert_eq!(cstr(&fields[2..]), "c1");
        assert_eq!(
            data_row(&seen[1].1),
            vec![Some(b"1".to_vec()), Some(b"2".to_vec())]
        );
        assert_eq!(
            data_row(&seen[2].1),
            vec![Some(b"3".to_vec()), Some(b"4".to_vec())]
        );
        assert_eq!(cstr(&seen[3].1), "SELECT 2");
        assert_eq!(seen[4].1, vec![b'I']);
    }

    #[tokio::test]
    async fn simple_query_edge_cases() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;

        assert_eq!(tags(&client.query("  ").await), "IZ");
        assert_eq!(tags(&client.query(";").await), "IZ");

        let seen = client.query("select 1; select 2").await;
        assert_eq!(tags(&seen), "EZ");
        assert_eq!(error_field(&seen[0].1, b'C'), "0A000");

        let seen = client.query("selec 1").await;
        assert_eq!(tags(&seen), "EZ");
        assert_eq!(error_field(&seen[0].1, b'C'), "42601");
        assert_eq!(error_field(&seen[0].1, b'S'), "ERROR");

        let seen = client.query("create table u as select 1").await;
        assert_eq!(cstr(&seen[0].1), "SELECT 4");
        let seen = client.query("  delete from t  ").await;
        assert_eq!(cstr(&seen[0].1), "DELETE 1");
        assert!(harness.calls.all().contains(&"sql:delete from t".to_string()));
    }

    #[tokio::test]
    async fn portal_runs_backend_once() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("", "delete from t where f=$1").await;
        client.bind("", "", &["5"]).await;
        client.execute("", 0).await;
        client.execute("", 0).await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "12CCZ");
        assert_eq!(cstr(&seen[2].1), "DELETE 1");
        assert_eq!(harness.calls.count("sql:delete from t where f='5'"), 1);
    }

    #[tokio::test]
    async fn row_limit_suspends_and_resumes() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("s", "select * from big").await;
        client.bind("p", "s", &[]).await;
        client.send(b'D', |b| {
            b.put_u8(b'P').unwrap();
            b.put_cstring("p").unwrap();
        })
        .await;
        client.execute("p", 2).await;
        client.execute("p", 2).await;
        client.execute("p", 0).await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "12TDDsDDsDCZ");
        assert_eq!(data_row(&seen[3].1), vec![Some(b"1".to_vec())]);
        assert_eq!(data_row(&seen[9].1), vec![Some(b"5".to_vec())]);
        assert_eq!(cstr(&seen[10].1), "SELECT 1");
        assert_eq!(harness.calls.count("sql:select * from big"), 1);
    }

    #[tokio::test]
    async fn limit_matching_row_count_completes() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("", "select * from t").await;
        client.bind("", "", &[]).await;
        client.execute("", 2).await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "12DDCZ");
        assert_eq!(cstr(&seen[4].1), "SELECT 2");
    }

    #[tokio::test]
    async fn describe_variants() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("s", "delete from t").await;
        client.bind("p", "s", &[]).await;
        client.send(b'D', |b| {
            b.put_u8(b'P').unwrap();
            b.put_cstring("p").unwrap();
        })
        .await;
        client.send(b'D', |b| {
            b.put_u8(b'S').unwrap();
            b.put_cstring("s").unwrap();
        })
        .await;
        client.send(b'D', |b| {
            b.put_u8(b'P').unwrap();
            b.put_cstring("nope").unwrap();
        })
        .await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "12nEEZ");
        assert_eq!(error_field(&seen[3].1, b'C'), "0A000");
        assert_eq!(error_field(&seen[4].1, b'C'), "34000");
    }

    #[tokio::test]
    async fn unnamed_portal_rebinds_silently() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("", "delete from t where f=$1").await;
        client.bind("", "", &["1"]).await;
        client.bind("", "", &["2"]).await;
        client.execute("", 0).await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "122CZ");
        assert_eq!(harness.calls.count("sql:delete from t where f='2'"), 1);
        assert_eq!(harness.calls.count("sql:delete from t where f='1'"), 0);
    }

    #[tokio::test]
    async fn named_collisions_are_client_errors() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("s", "delete from t").await;
        client.parse("s", "delete from u").await;
        client.bind("p", "s", &[]).await;
        client.bind("p", "s", &[]).await;
        client.bind("q", "ghost", &[]).await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "1E2EEZ");
        assert_eq!(error_field(&seen[1].1, b'C'), "42P05");
        assert_eq!(error_field(&seen[3].1, b'C'), "42P03");
        assert_eq!(error_field(&seen[4].1, b'C'), "26000");
    }

    #[tokio::test]
    async fn closing_statement_closes_its_portals() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("s", "delete from t").await;
        client.bind("p", "s", &[]).await;
        client.send(b'C', |b| {
            b.put_u8(b'S').unwrap();
            b.put_cstring("s").unwrap();
        })
        .await;
        client.send(b'C', |b| {
            b.put_u8(b'P').unwrap();
            b.put_cstring("never-bound").unwrap();
        })
        .await;
        client.execute("p", 0).await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "1233EZ");
        assert_eq!(error_field(&seen[4].1, b'C'), "34000");
        assert_eq!(harness.calls.count("sql:delete from t"), 0);
    }

    #[tokio::test]
    async fn bind_errors_keep_session() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("s", "delete from t where a=$1").await;
        // binary result columns
        client.bind_with("p", "s", &[], &["1"], &[1]).await;
        // two format codes for one parameter
        client.bind_with("p", "s", &[0, 0], &["1"], &[]).await;
        // placeholder without a parameter
        client.bind("p", "s", &[]).await;
        // binary 4-byte integer
        client.send(b'B', |b| {
            b.put_cstring("p").unwrap();
            b.put_cstring("s").unwrap();
            b.put_i16(1).unwrap();
            b.put_i16(1).unwrap();
            b.put_i16(1).unwrap();
            b.put_i32(4).unwrap();
            b.put_i32(-7).unwrap();
            b.put_i16(0).unwrap();
        })
        .await;
        client.execute("p", 0).await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "1EEE2CZ");
        assert_eq!(error_field(&seen[1].1, b'C'), "0A000");
        assert_eq!(error_field(&seen[2].1, b'C'), "08P01");
        assert_eq!(
            error_field(&seen[3].1, b'M'),
            "missing parameter for placeholder number 1"
        );
        assert_eq!(harness.calls.count("sql:delete from t where a=-7"), 1);
    }

    #[tokio::test]
    async fn null_parameter_binds_null() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.parse("", "delete from t where a=$1").await;
        client.send(b'B', |b| {
            b.put_cstring("").unwrap();
            b.put_cstring("").unwrap();
            b.put_i16(0).unwrap();
            b.put_i16(1).unwrap();
            b.put_i32(-1).unwrap();
            b.put_i16(0).unwrap();
        })
        .await;
        client.execute("", 0).await;
        client.sync().await;
        assert_eq!(harness.calls.count("sql:delete from t where a=NULL"), 1);
    }

    #[tokio::test]
    async fn function_call_and_copy_unsupported() {
        let harness = Harness::new();
        let (mut client, _handle, _, _) = harness.login().await;
        client.send(b'F', |b| {
            b.put_i32(1234).unwrap();
            b.put_i16(0).unwrap();
            b.put_i16(0).unwrap();
            b.put_i16(0).unwrap();
        })
        .await;
        client.send(b'd', |b| b.put_bytes(b"1\t2\n").unwrap()).await;
        client.send(b'c', |_| {}).await;
        client.send(b'f', |b| b.put_cstring("abort").unwrap()).await;
        let seen = client.sync().await;
        assert_eq!(tags(&seen), "EEEEZ");
        for (_, body) in &seen[..4] {
            assert_eq!(error_field(body, b'C'), "0A000");
        }
    }

    #[tokio::test]
    async fn latin1_client_encoding() {
        let harness = Harness::new();
        let (mut client, _handle) = harness.connect();
        client
            .startup(&[("user", "alice"), ("client_encoding", "LATIN1")])
            .await;
        let mut encoding = None;
        loop {
            let (tag, body) = client.recv().await;
            if tag == b'S' && cstr(&body) == "client_encoding" {
                encoding = Some(cstr(&body["client_encoding".len() + 1..]));
            }
            if tag == b'Z' {
                break;
            }
        }
        assert_eq!(encoding.as_deref(), Some("LATIN1"));
        let seen = client.query("select name").await;
        assert_eq!(tags(&seen), "TDCZ");
        assert_eq!(
            data_row(&seen[1].1),
            vec![Some(vec![b'c', b'a', b'f', 0xe9]), None]
        );

        let mut builder = MessageBuilder::with_charset(Some(b'Q'), Charset::Latin1);
        builder.put_cstring("select pr\u{e9}nom").unwrap();
        client.send_raw(&builder.finish().expect("frame")).await;
        let seen = client.until_ready().await;
        assert_eq!(tags(&seen), "TDCZ");
        assert_eq!(&seen[0].1[2..9], b"pr\xe9nom\0");

        let mut builder = MessageBuilder::with_charset(Some(b'Q'), Charset::Latin1);
        builder.put_cstring("caf\u{e9}").unwrap();
        client.send_raw(&builder.finish().expect("frame")).await;
        let seen = client.until_ready().await;
        assert_eq!(tags(&seen), "EZ");
        let error = &seen[0].1;
        assert!(error.windows(6).any(|w| w == b"\"caf\xe9\""));
        assert!(!error.windows(2).any(|w| w == [0xc3, 0xa9]));
    }

    #[tokio::test]
    async fn cancel_request_needs_matching_key() {
        let harness = Harness::new();
        let (mut target, target_handle, pid, key) = harness.login().await;

        let (mut other, handle) = harness.connect();
        other.send_raw(&cancel_packet(pid, key.wrapping_add(1))).await;
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::NotAuthenticated));
        assert!(other.read_to_end().await.is_empty());
        let (mut other, handle) = harness.connect();
        other.send_raw(&cancel_packet(pid.wrapping_add(1000), key)).await;
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::NotAuthenticated));

        // still alive
        assert_eq!(tags(&target.query("select * from t").await), "TDDCZ");

        let (mut other, handle) = harness.connect();
        other.send_raw(&cancel_packet(pid, key)).await;
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::NotAuthenticated));
        assert_eq!(target_handle.await.unwrap(), Some(SessionOutcome::Closed));
        assert!(!harness.processes.contains(pid));
    }

    #[tokio::test]
    async fn trailing_bytes_end_session() {
        let harness = Harness::new();
        let (mut client, handle, _, _) = harness.login().await;
        client.send(b'Q', |b| {
            b.put_cstring("select * from t").unwrap();
            b.put_u8(7).unwrap();
        })
        .await;
        assert_eq!(handle.await.unwrap(), None);
        assert!(client.read_to_end().await.is_empty());
        assert_eq!(harness.calls.count("sql:select * from t"), 0);
    }

    #[tokio::test]
    async fn short_message_ends_session() {
        let harness = Harness::new();
        let (mut client, handle, _, _) = harness.login().await;
        // Execute that declares only its portal name
        client.send(b'E', |b| b.put_cstring("").unwrap()).await;
        client.send(b'S', |_| {}).await;
        assert_eq!(handle.await.unwrap(), None);
        assert!(client.read_to_end().await.is_empty());
    }

    #[tokio::test]
    async fn password_length_mismatch_is_fatal() {
        let harness = Harness::new();
        let (mut client, handle) = harness.connect();
        client.startup(&[("user", "fred")]).await;
        client.recv().await;
        let mut packet = vec![b'p'];
        packet.extend_from_slice(&13i32.to_be_bytes());
        packet.extend_from_slice(b"secret\0xx");
        client.send_raw(&packet).await;
        assert_eq!(handle.await.unwrap(), None);
        assert_eq!(harness.calls.count("password:secret"), 0);
    }

    #[tokio::test]
    async fn unknown_command_closes_silently() {
        let harness = Harness::new();
        let (mut client, handle, _, _) = harness.login().await;
        client.send(b'?', |_| {}).await;
        assert_eq!(handle.await.unwrap(), None);
        assert!(client.read_to_end().await.is_empty());
    }

    #[tokio::test]
    async fn hangup_reports_closed() {
        let harness = Harness::new();
        let (client, handle, pid, _) = harness.login().await;
        drop(client);
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::Closed));
        assert!(!harness.processes.contains(pid));

        let (client, handle) = harness.connect();
        drop(client);
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::NotAuthenticated));
    }

    #[tokio::test]
    async fn connection_limit_rejects_with_fatal() {
        let mut harness = Harness::new();
        harness.options.max_connections = 1;
        let (mut first, first_handle, _, _) = harness.login().await;

        let (mut client, handle) = harness.connect();
        client.startup(&[("user", "bob")]).await;
        let (tag, body) = client.recv().await;
        assert_eq!(tag, b'E');
        assert_eq!(error_field(&body, b'S'), "FATAL");
        assert_eq!(error_field(&body, b'C'), "53300");
        assert_eq!(error_field(&body, b'M'), "sorry, too many clients already");
        assert!(client.read_to_end().await.is_empty());
        assert_eq!(handle.await.unwrap(), None);
        // rejected before the login was looked at
        assert_eq!(harness.calls.count("user:bob"), 0);
        assert_eq!(harness.processes.live_count(), 1);

        first.send(b'X', |_| {}).await;
        assert_eq!(first_handle.await.unwrap(), Some(SessionOutcome::Terminated));
        let (_client, _handle, _, _) = harness.login().await;
    }

    #[tokio::test]
    async fn cancel_reaches_full_server() {
        let mut harness = Harness::new();
        harness.options.max_connections = 1;
        let (_target, target_handle, pid, key) = harness.login().await;

        let (mut other, handle) = harness.connect();
        other.send_raw(&cancel_packet(pid, key)).await;
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::NotAuthenticated));
        assert!(other.read_to_end().await.is_empty());
        assert_eq!(target_handle.await.unwrap(), Some(SessionOutcome::Closed));
        assert_eq!(harness.processes.live_count(), 0);
    }

    #[tokio::test]
    async fn cancel_kills_session_blocked_on_writes() {
        let harness = Harness::new();
        let (client, handle, pid, key) = harness.login_sized(256).await;
        let (_unread, write_half) = tokio::io::split(client.stream);
        let flood = flood_queries(write_half, 200);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert!(harness.processes.cancel(pid, key));
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("session ends after cancel")
            .unwrap();
        assert_eq!(outcome, Some(SessionOutcome::Closed));
        assert!(!harness.processes.contains(pid));
        flood.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_interrupts_backend_call() {
        let harness = Harness::new();
        let (mut client, handle, pid, key) = harness.login().await;
        client
            .send(b'Q', |b| b.put_cstring("select pg_sleep(10)").unwrap())
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(harness.calls.count("sql:select pg_sleep(10)"), 1);

        let (mut other, other_handle) = harness.connect();
        other.send_raw(&cancel_packet(pid, key)).await;
        assert_eq!(
            other_handle.await.unwrap(),
            Some(SessionOutcome::NotAuthenticated)
        );
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("session ends after cancel")
            .unwrap();
        assert_eq!(outcome, Some(SessionOutcome::Closed));
        assert!(client.read_to_end().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_client_times_out_on_writes() {
        let mut harness = Harness::new();
        harness.options.idle_timeout = Some(std::time::Duration::from_secs(5));
        let (client, handle, pid, _) = harness.login_sized(256).await;
        let (_unread, write_half) = tokio::io::split(client.stream);
        let flood = flood_queries(write_half, 200);
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::Closed));
        assert!(!harness.processes.contains(pid));
        flood.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_times_out() {
        let mut harness = Harness::new();
        harness.options.idle_timeout = Some(std::time::Duration::from_secs(5));
        let (_client, handle, _, _) = harness.login().await;
        assert_eq!(handle.await.unwrap(), Some(SessionOutcome::Closed));
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("pgsession.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            listen_addr = "127.0.0.1:6543"
            idle_timeout_secs = 30

            [session]
            charset = "LATIN1"
            parameter_status = { DateStyle = "ISO, MDY" }

            [[queries]]
            sql = "select 1"
            kind = "select"
            columns = ["one"]
            rows = [["1"]]
            "#,
        )
        .expect("write");
        let config = Config::from_path(path.to_str().unwrap()).expect("load");
        assert_eq!(config.server.listen_addr, "127.0.0.1:6543");
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.idle_timeout(), Some(std::time::Duration::from_secs(30)));
        assert_eq!(config.session.charset, Charset::Latin1);
        let settings = config.session_settings();
        assert_eq!(settings.server_version, "9.4");
        assert_eq!(
            settings.parameter_status.get("DateStyle").map(String::as_str),
            Some("ISO, MDY")
        );
    }

    #[test]
    fn config_validation_rejects_bad_queries() {
        let ragged = r#"
            [[queries]]
            sql = "select 1"
            kind = "select"
            columns = ["a", "b"]
            rows = [["1"]]
        "#;
        assert!(Config::from_toml(ragged).is_err());

        let both = r#"
            [[auth.users]]
            username = "x"
            password_plain = "a"
            password_hash = "b"
        "#;
        assert!(Config::from_toml(both).is_err());

        assert!(Config::from_toml("[session]\ncharset = \"EBCDIC\"").is_err());
        assert!(Config::from_toml("[logging]\nlevel = \"loud\"").is_err());
        assert!(Config::from_toml("").is_ok());
    }
}
