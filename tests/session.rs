mod common;

use std::{sync::Arc, time::Duration};

use rangeplay::{
    error::ErrorKind,
    http::Transport,
    session::{Outcome, Session},
    util::MIB,
};
use tokio::io::AsyncReadExt;

use common::{settings, Fault, MediaServer, Refresher};

fn session(server: &Arc<MediaServer>, refresher: &Refresher, path: &str) -> Session {
    let transport: Arc<dyn Transport> = Arc::clone(server) as Arc<dyn Transport>;
    Session::new(
        refresher.information(server.url(path)),
        server.url("/watch?v=1"),
        transport,
        settings(),
    )
}

#[tokio::test(start_paused = true)]
async fn fetches_sequential_ranges_until_complete() {
    let server = Arc::new(MediaServer::new().with_file("/media", 3 * MIB));
    let refresher = Refresher::new(server.url("/media"), 3 * MIB, Duration::from_secs(180));
    let session = session(&server, &refresher, "/media");

    let mut stream = session.take_stream().unwrap();
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.unwrap();

    assert!(session.finished().await.is_completed());
    assert_eq!(&data[..], &server.file("/media")[..]);
    assert_eq!(
        server.ranges(),
        [
            "bytes=0-1048576",
            "bytes=1048576-2097152",
            "bytes=2097152-3145728"
        ]
    );
    assert_eq!(session.bytes_received(), 3 * MIB);
    assert_eq!(session.bytes_read(), 3 * MIB);
    assert!(session.is_fetch_completed());
    assert!(!session.is_locked());
    assert_eq!(server.max_in_flight(), 1);
    assert_eq!(refresher.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn refreshes_expired_url_and_retries() {
    let server = Arc::new(MediaServer::new().with_file("/media", 2 * MIB));
    let expired = server.url("/media?sig=old");
    let fresh = server.url("/media?sig=new");
    server.expire(&expired);

    let refresher = Refresher::new(fresh.clone(), 2 * MIB, Duration::from_secs(120));
    let session = session(&server, &refresher, "/media?sig=old");

    let mut stream = session.take_stream().unwrap();
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.unwrap();

    assert!(session.finished().await.is_completed());
    assert_eq!(data.len() as u64, 2 * MIB);
    assert_eq!(session.bytes_received(), 2 * MIB);
    assert_eq!(refresher.calls(), 1);
    assert_eq!(session.information().url(), &fresh);

    let requests = server.requests();
    assert_eq!(requests[0].url, expired);
    assert_eq!(requests[0].range, requests[1].range);
    assert!(requests[1..].iter().all(|request| request.url == fresh));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_retries() {
    let server = Arc::new(MediaServer::new().with_file("/media", MIB));
    let expired = server.url("/media?sig=old");
    server.expire(&expired);

    // Every refresh hands out the same dead URL.
    let refresher = Refresher::new(expired, MIB, Duration::from_secs(60));
    let session = session(&server, &refresher, "/media?sig=old");
    let _stream = session.take_stream();

    let Outcome::Failed(e) = session.finished().await else {
        panic!("session did not fail");
    };

    assert_eq!(e.kind, ErrorKind::ResourceExhausted);
    assert_eq!(server.requests().len(), 4);
    assert_eq!(refresher.calls(), 3);
    assert_eq!(session.bytes_received(), 0);
    assert!(!session.is_locked());
}

#[tokio::test(start_paused = true)]
async fn fails_on_redirect_loop() {
    let server = MediaServer::new().with_file("/media", MIB);
    let a = server.url("/a");
    let b = server.url("/b");
    let server = Arc::new(server.with_redirect(&a, &b).with_redirect(&b, &a));

    let refresher = Refresher::new(a, MIB, Duration::from_secs(60));
    let session = session(&server, &refresher, "/a");
    let _stream = session.take_stream();

    let Outcome::Failed(e) = session.finished().await else {
        panic!("session did not fail");
    };

    assert_eq!(e.kind, ErrorKind::ResourceExhausted);
    assert!(e.to_string().contains("redirection loop"), "{e}");

    // Each of the four attempts follows a -> b, then detects b -> a.
    assert_eq!(server.requests().len(), 8);
}

#[tokio::test(start_paused = true)]
async fn waits_for_consumer_before_fetching_more() {
    let server = Arc::new(MediaServer::new().with_file("/media", 4 * MIB));
    let refresher = Refresher::new(server.url("/media"), 4 * MIB, Duration::from_secs(240));
    let session = session(&server, &refresher, "/media");
    let mut stream = session.take_stream().unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.ranges().len(), 1);
    assert_eq!(stream.available() as u64, MIB);

    let mut half = vec![0; usize::try_from(MIB / 2).unwrap()];
    stream.read_exact(&mut half).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(server.ranges().len(), 2);
    assert_eq!(stream.available() as u64, MIB + MIB / 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.ranges().len(), 2);
    assert!(session.outcome().is_none());
}

#[tokio::test(start_paused = true)]
async fn destroy_is_idempotent() {
    let server = Arc::new(MediaServer::new().with_file("/media", 2 * MIB));
    let refresher = Refresher::new(server.url("/media"), 2 * MIB, Duration::from_secs(120));
    let session = session(&server, &refresher, "/media");
    let mut stream = session.take_stream().unwrap();

    session.destroy();
    session.destroy();

    assert!(session.is_destroyed());
    assert!(matches!(session.finished().await, Outcome::Destroyed));

    // Destroyed after the fact: still destroyed, nothing else happens.
    session.destroy();
    assert!(matches!(session.outcome(), Some(Outcome::Destroyed)));

    let mut data = Vec::new();
    assert_eq!(stream.read_to_end(&mut data).await.unwrap(), 0);
    assert!(server.ranges().len() <= 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_closes_the_session() {
    let server = Arc::new(MediaServer::new().with_file("/media", 3 * MIB));
    let refresher = Refresher::new(server.url("/media"), 3 * MIB, Duration::from_secs(180));
    let session = session(&server, &refresher, "/media");

    let mut stream = session.take_stream().unwrap();
    let mut head = [0; 4096];
    stream.read_exact(&mut head).await.unwrap();
    drop(stream);

    assert!(matches!(session.finished().await, Outcome::Closed));
    assert!(session.take_stream().is_none());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.ranges().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoning_unread_data_closes_the_session() {
    let server = Arc::new(MediaServer::new().with_file("/media", 512 * 1024));
    let refresher = Refresher::new(server.url("/media"), 512 * 1024, Duration::from_secs(30));
    let session = session(&server, &refresher, "/media");
    let mut stream = session.take_stream().unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(session.is_fetch_completed());
    assert!(session.outcome().is_none());

    let mut head = [0; 4096];
    stream.read_exact(&mut head).await.unwrap();
    drop(stream);

    assert!(matches!(session.finished().await, Outcome::Closed));
    assert_eq!(session.bytes_read(), 4096);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_after_reading_everything_completes() {
    let server = Arc::new(MediaServer::new().with_file("/media", 512 * 1024));
    let refresher = Refresher::new(server.url("/media"), 512 * 1024, Duration::from_secs(30));
    let session = session(&server, &refresher, "/media");

    let mut stream = session.take_stream().unwrap();
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.unwrap();
    drop(stream);

    assert!(session.finished().await.is_completed());
    assert_eq!(data.len(), 512 * 1024);
}

#[tokio::test(start_paused = true)]
async fn resumes_after_broken_body() {
    let server = Arc::new(
        MediaServer::new()
            .with_file("/media", 2 * MIB)
            .with_fault("/media", Fault::BrokenBody),
    );
    let refresher = Refresher::new(server.url("/media"), 2 * MIB, Duration::from_secs(120));
    let session = session(&server, &refresher, "/media");

    let mut stream = session.take_stream().unwrap();
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.unwrap();

    assert!(session.finished().await.is_completed());
    assert_eq!(&data[..], &server.file("/media")[..]);
    assert_eq!(
        server.ranges(),
        [
            "bytes=0-1048576",
            "bytes=524288-1572864",
            "bytes=1572864-2097152"
        ]
    );
    assert_eq!(refresher.calls(), 1);
    assert_eq!(server.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_response_without_body_on_next_tick() {
    let server = Arc::new(
        MediaServer::new()
            .with_file("/media", 2 * MIB)
            .with_fault("/media", Fault::NoBody),
    );
    let refresher = Refresher::new(server.url("/media"), 2 * MIB, Duration::from_secs(120));
    let session = session(&server, &refresher, "/media");

    let mut stream = session.take_stream().unwrap();
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.unwrap();

    assert!(session.finished().await.is_completed());
    assert_eq!(&data[..], &server.file("/media")[..]);
    assert_eq!(
        server.ranges(),
        [
            "bytes=0-1048576",
            "bytes=0-1048576",
            "bytes=1048576-2097152"
        ]
    );
    assert_eq!(refresher.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn starts_at_offset() {
    let server = Arc::new(MediaServer::new().with_file("/media", 3 * MIB));
    let refresher = Refresher::new(server.url("/media"), 3 * MIB, Duration::from_secs(180));
    let transport: Arc<dyn Transport> = Arc::clone(&server) as Arc<dyn Transport>;
    let session = Session::starting_at(
        refresher.information(server.url("/media")),
        server.url("/watch?v=1"),
        2 * MIB,
        transport,
        settings(),
    );

    let mut stream = session.take_stream().unwrap();
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.unwrap();

    assert!(session.finished().await.is_completed());
    assert_eq!(&data[..], &server.file("/media")[2 * 1024 * 1024..]);
    assert_eq!(server.ranges(), ["bytes=2097152-3145728"]);
    assert_eq!(session.position(), Duration::from_secs(180));
}
