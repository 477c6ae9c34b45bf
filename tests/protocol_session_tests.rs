use pgvault::error::{ErrorKind, ProtocolError};
use pgvault::protocol::{
    HandleRead, JobState, ProtocolClient, ProtocolCommand, ProtocolParallel, ProtocolParallelJob, ProtocolServer,
    ServerIo,
};
use serde_json::{json, Value};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Handler used by every test server
fn test_handler(command: &str, params: &[Value], server: &mut ServerIo) -> anyhow::Result<bool> {
    match command {
        "request-simple" => server.response(Some(json!(true)))?,
        "request-complex" => {
            server.response(Some(json!(false)))?;
            server.write_line("LINEOFTEXT")?;
        }
        "error-assert" => return Err(ProtocolError::raised(ErrorKind::Assert, "test assert").into()),
        "error-plain" => anyhow::bail!("plain failure"),
        "echo" => server.response(params.first().cloned())?,
        "sleep-echo" => {
            let millis = params.first().and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(millis));
            server.response(params.get(1).cloned())?;
        }
        "fail" => {
            return Err(ProtocolError::raised(ErrorKind::Protocol, "very serious error").into());
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// A client connected to a server running on its own thread
fn session(name: &str) -> (ProtocolClient, JoinHandle<pgvault::error::Result<()>>) {
    session_with_timeout(name, TIMEOUT)
}

/// Same as [`session`], with the client's read timeout set
fn session_with_timeout(
    name: &str,
    client_timeout: Duration,
) -> (ProtocolClient, JoinHandle<pgvault::error::Result<()>>) {
    let (client_read, server_write) = os_pipe::pipe().unwrap();
    let (server_read, client_write) = os_pipe::pipe().unwrap();

    let server = thread::spawn(move || {
        let mut server = ProtocolServer::new(
            "test server",
            "test",
            Box::new(HandleRead::new("server read", server_read, TIMEOUT)),
            Box::new(server_write),
        )?;
        server.handler_add(test_handler);
        server.process()
    });

    let client = ProtocolClient::new(
        name,
        "test",
        Box::new(HandleRead::new(format!("{name} read"), client_read, client_timeout)),
        Box::new(client_write),
    );

    (client, server)
}

#[test]
fn test_simple_and_complex_requests() {
    let (mut client, server) = session("test client");

    client.noop().unwrap();
    assert_eq!(
        client.execute(&ProtocolCommand::new("request-simple"), true).unwrap(),
        Some(json!(true))
    );
    assert_eq!(
        client.execute(&ProtocolCommand::new("request-complex"), true).unwrap(),
        Some(json!(false))
    );
    assert_eq!(client.read_line().unwrap(), "LINEOFTEXT");
    assert_eq!(
        client
            .execute(&ProtocolCommand::new("echo").param(json!([1, "two", null])), true)
            .unwrap(),
        Some(json!([1, "two", null]))
    );

    client.close();
    server.join().unwrap().unwrap();
}

#[test]
fn test_errors_are_attributed_and_loop_survives() {
    let (mut client, server) = session("test client");

    let err = client.execute(&ProtocolCommand::new("error-assert"), false).unwrap_err();
    assert_eq!(err.to_string(), "raised from test client: test assert");
    assert_eq!(err.code(), 25);

    let err = client.execute(&ProtocolCommand::new("error-plain"), false).unwrap_err();
    assert_eq!(err.to_string(), "raised from test client: plain failure");
    assert_eq!(err.code(), 122);
    assert_eq!(err.stack(), Some("no stack trace available"));

    let err = client.execute(&ProtocolCommand::new("bogus"), false).unwrap_err();
    assert_eq!(err.to_string(), "raised from test client: invalid command 'bogus'");
    assert_eq!(err.code(), 39);

    // Output contract mismatches leave the session usable
    assert!(matches!(
        client.execute(&ProtocolCommand::new("request-simple"), false),
        Err(ProtocolError::OutputNotRequired)
    ));
    client.noop().unwrap();

    drop(client);
    server.join().unwrap().unwrap();
}

#[test]
fn test_greeting_service_mismatch() {
    let (client_read, server_write) = os_pipe::pipe().unwrap();
    let (server_read, client_write) = os_pipe::pipe().unwrap();

    let server = thread::spawn(move || {
        ProtocolServer::new(
            "test server",
            "test",
            Box::new(HandleRead::new("server read", server_read, TIMEOUT)),
            Box::new(server_write),
        )
        .map(|_| ())
    });

    let err = ProtocolClient::connect(
        "test client",
        "bogus",
        Box::new(HandleRead::new("client read", client_read, TIMEOUT)),
        Box::new(client_write),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ProtocolError::Handshake(_)));
    assert_eq!(
        err.to_string(),
        "expected value 'bogus' for greeting key 'service' but got 'test'"
    );

    server.join().unwrap().unwrap();
}

#[test]
fn test_server_stops_on_transport_eof() {
    let (client_read, server_write) = os_pipe::pipe().unwrap();
    let (server_read, client_write) = os_pipe::pipe().unwrap();

    let server = thread::spawn(move || {
        let mut server = ProtocolServer::new(
            "test server",
            "test",
            Box::new(HandleRead::new("server read", server_read, TIMEOUT)),
            Box::new(server_write),
        )?;
        server.process()
    });

    // Peer goes away without sending exit
    drop(client_write);
    assert!(matches!(server.join().unwrap(), Err(ProtocolError::Eof(_))));
    drop(client_read);
}

#[test]
fn test_dropped_client_ends_session_cleanly() {
    let (mut client, server) = session("test client");
    client.noop().unwrap();
    drop(client);

    server.join().unwrap().unwrap();
}

#[test]
fn test_parallel_single_job() {
    let (client, server) = session("test client 1");
    let mut parallel = ProtocolParallel::new(TIMEOUT);
    parallel.client_add(client);

    parallel.job_add(ProtocolParallelJob::new(
        "job1",
        ProtocolCommand::new("echo").param("x"),
    ));
    assert_eq!(parallel.to_string(), "{state: pending, clientTotal: 1, jobTotal: 1}");

    assert_eq!(parallel.process().unwrap(), 1);
    let job = parallel.result().unwrap();
    assert_eq!(job.key(), &json!("job1"));
    assert_eq!(job.state(), JobState::Done);
    assert_eq!(job.process_id(), 1);
    assert_eq!(job.result(), Some(&json!("x")));
    assert_eq!(job.error_code(), 0);

    assert!(parallel.done());
    assert!(parallel.result().is_none());
    assert_eq!(parallel.to_string(), "{state: done, clientTotal: 1, jobTotal: 0}");

    drop(parallel);
    server.join().unwrap().unwrap();
}

#[test]
fn test_parallel_completion_order_follows_readiness() {
    let (client1, server1) = session("test client 1");
    let (client2, server2) = session("test client 2");

    let mut parallel = ProtocolParallel::new(TIMEOUT);
    parallel.client_add(client1);
    parallel.client_add(client2);

    parallel.job_add(ProtocolParallelJob::new(
        "job1",
        ProtocolCommand::new("sleep-echo").param(750).param("job1"),
    ));
    parallel.job_add(ProtocolParallelJob::new(
        "job2",
        ProtocolCommand::new("sleep-echo").param(0).param("job2"),
    ));
    parallel.job_add(ProtocolParallelJob::new("job3", ProtocolCommand::new("fail")));

    let mut completed = Vec::new();
    while !parallel.done() {
        parallel.process().unwrap();
        while let Some(job) = parallel.result() {
            completed.push(job);
        }
    }

    let keys: Vec<&Value> = completed.iter().map(|job| job.key()).collect();
    assert_eq!(keys, vec![&json!("job2"), &json!("job3"), &json!("job1")]);

    assert_eq!(completed[0].process_id(), 2);
    assert_eq!(completed[0].result(), Some(&json!("job2")));

    assert_eq!(completed[1].process_id(), 2);
    assert_eq!(completed[1].error_code(), 39);
    assert_eq!(
        completed[1].error_message().as_deref(),
        Some("raised from test client 2: very serious error")
    );
    assert!(completed[1].result().is_none());

    assert_eq!(completed[2].process_id(), 1);
    assert_eq!(completed[2].result(), Some(&json!("job1")));

    drop(parallel);
    server1.join().unwrap().unwrap();
    server2.join().unwrap().unwrap();
}

#[test]
fn test_parallel_wait_timeout_is_not_an_error() {
    let (mut client, server) = session("test client 1");
    {
        let mut parallel = ProtocolParallel::new(Duration::from_millis(50));
        parallel.client_add(&mut client);
        parallel.job_add(ProtocolParallelJob::new(
            json!({"file": "000000010000000100000001"}),
            ProtocolCommand::new("sleep-echo").param(400).param("late"),
        ));

        assert_eq!(parallel.process().unwrap(), 0);
        assert!(!parallel.done());
        assert_eq!(parallel.to_string(), "{state: running, clientTotal: 1, jobTotal: 1}");

        let mut total = 0;
        while total == 0 {
            total = parallel.process().unwrap();
        }
        let job = parallel.result().unwrap();
        assert_eq!(job.key(), &json!({"file": "000000010000000100000001"}));
        assert_eq!(job.into_result().unwrap(), Some(json!("late")));
        assert!(parallel.done());
    }

    // The borrowed client is still usable after the dispatcher is gone
    client.noop().unwrap();
    client.close();
    server.join().unwrap().unwrap();
}

#[test]
fn test_parallel_silent_client_times_out_job() {
    let (client, server) = session_with_timeout("test client 1", Duration::from_millis(200));
    let mut parallel = ProtocolParallel::new(Duration::from_millis(50));
    parallel.client_add(client);

    parallel.job_add(ProtocolParallelJob::new(
        "job1",
        ProtocolCommand::new("sleep-echo").param(1000).param("late"),
    ));
    parallel.job_add(ProtocolParallelJob::new("job2", ProtocolCommand::new("echo").param("never")));

    let started = Instant::now();
    let mut completed = Vec::new();
    while !parallel.done() {
        parallel.process().unwrap();
        while let Some(job) = parallel.result() {
            completed.push(job);
        }
        assert!(started.elapsed() < Duration::from_secs(5), "dispatcher never gave up");
    }

    assert_eq!(completed.len(), 2);

    assert_eq!(completed[0].key(), &json!("job1"));
    assert_eq!(completed[0].state(), JobState::Done);
    assert!(matches!(completed[0].error(), Some(ProtocolError::Timeout { .. })));
    assert_eq!(
        completed[0].error_message().as_deref(),
        Some("timeout after 200ms waiting for read from 'test client 1'")
    );

    // The silent client is retired, so the queued job has nowhere to run
    assert_eq!(completed[1].key(), &json!("job2"));
    assert_eq!(completed[1].error_code(), 39);
    assert_eq!(completed[1].error_message().as_deref(), Some("no client left to run job"));

    drop(parallel);
    // The server's late reply hits a closed pipe, so its result is not checked
    let _ = server.join();
}
