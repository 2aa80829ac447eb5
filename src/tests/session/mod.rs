use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use super::{FakeTransport, Recorder, Script, base_url, blob, book_request, uploader};
use crate::{
    auth::AuthStore,
    upload::{
        FileBlob, Method, PreconditionError, UploadError, UploadPolicy, UploadRequest, Uploader,
    },
};

const CREATED: Script = Script::Respond {
    status: 200,
    body: r#"{"id":"rec1","title":"Meditations"}"#,
};

fn assert_non_decreasing(percents: &[u8]) {
    assert!(
        percents.windows(2).all(|pair| pair[0] <= pair[1]),
        "progress went backwards: {percents:?}"
    );
}

#[tokio::test]
async fn create_without_required_file_is_rejected_before_any_attempt() {
    let transport = FakeTransport::always(CREATED);
    let recorder = Recorder::default();
    let request = UploadRequest::create("books")
        .file("coverImage", blob("cover.jpg", b"cover"))
        .require_file("coverImage")
        .require_file("pdfFile");

    let outcome = uploader(transport.clone())
        .submit(request, Arc::new(recorder.clone()))
        .await;

    assert_eq!(
        outcome,
        Err(UploadError::Precondition(PreconditionError::MissingFile(
            "pdfFile".into()
        )))
    );
    assert_eq!(transport.calls(), 0);
    assert!(recorder.reports().is_empty());
}

#[tokio::test]
async fn update_does_not_require_files() {
    let transport = FakeTransport::always(CREATED);
    let request = UploadRequest::update("books", "rec1")
        .field("title", "Meditations")
        .require_file("coverImage")
        .require_file("pdfFile");

    let uploaded = uploader(transport.clone())
        .submit(request, Arc::new(Recorder::default()))
        .await
        .unwrap();

    assert_eq!(uploaded.attempts, 1);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn file_over_two_gib_is_rejected_before_any_attempt() {
    let file = tempfile::NamedTempFile::new().unwrap();
    // sparse, nothing is written
    file.as_file().set_len(2 * 1024 * 1024 * 1024 + 1).unwrap();
    let document = FileBlob::from_path(file.path()).await.unwrap();
    let transport = FakeTransport::always(CREATED);
    let request = UploadRequest::create("books")
        .file("coverImage", blob("cover.jpg", b"cover"))
        .file("pdfFile", document);

    let outcome = uploader(transport.clone())
        .submit(request, Arc::new(Recorder::default()))
        .await;

    assert_eq!(
        outcome,
        Err(UploadError::Precondition(PreconditionError::FileTooLarge {
            field: "pdfFile".into(),
            size: 2 * 1024 * 1024 * 1024 + 1,
            limit: 2 * 1024 * 1024 * 1024,
        }))
    );
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn file_size_ceiling_is_configurable() {
    let transport = FakeTransport::always(CREATED);
    let policy = UploadPolicy {
        max_file_size: 4,
        ..Default::default()
    };
    let uploader = Uploader::new(transport.clone(), base_url(), AuthStore::default(), policy);

    let outcome = uploader
        .submit(book_request(), Arc::new(Recorder::default()))
        .await;

    assert!(matches!(
        outcome,
        Err(UploadError::Precondition(PreconditionError::FileTooLarge { ref field, .. }))
            if field == "coverImage"
    ));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn succeeds_on_nth_attempt() {
    for n in 1..=4usize {
        let transport = FakeTransport::new(vec![Script::NetworkError; n - 1], CREATED);
        let recorder = Recorder::default();

        let uploaded = uploader(transport.clone())
            .submit(book_request(), Arc::new(recorder.clone()))
            .await
            .unwrap();

        assert_eq!(uploaded.attempts, n as u32);
        assert_eq!(uploaded.record.id(), Some("rec1"));
        assert_eq!(transport.calls(), n);
        assert_eq!(
            transport
                .attempts()
                .iter()
                .map(|attempt| attempt.attempt)
                .collect::<Vec<_>>(),
            (0..n as u32).collect::<Vec<_>>()
        );
        let percents = recorder.percents();
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(percents.iter().filter(|&&p| p == 100).count(), 1);
        assert_non_decreasing(&percents);
        assert_eq!(recorder.statuses().len(), n - 1);
    }
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_four_attempts_with_fixed_backoff() {
    let transport = FakeTransport::always(Script::NetworkError);
    let recorder = Recorder::default();
    let started = Instant::now();

    let outcome = uploader(transport.clone())
        .submit(book_request(), Arc::new(recorder.clone()))
        .await;

    let Err(UploadError::Network { attempts, message }) = outcome else {
        panic!("expected a network error, got {outcome:?}");
    };
    assert_eq!(attempts, 4);
    assert!(message.contains("connection reset"));
    assert!(
        UploadError::Network { attempts, message }
            .to_string()
            .contains("after 4 attempts")
    );
    assert_eq!(transport.calls(), 4);
    assert!(started.elapsed() >= Duration::from_secs(9));
    assert_eq!(
        recorder.statuses(),
        [
            "retrying, attempt 2 of 4",
            "retrying, attempt 3 of 4",
            "retrying, attempt 4 of 4",
        ]
    );
    let percents = recorder.percents();
    assert_non_decreasing(&percents);
    assert!(percents.iter().all(|&p| p <= 99));
}

#[tokio::test(start_paused = true)]
async fn server_error_is_not_retried() {
    let transport = FakeTransport::new(
        [Script::Respond {
            status: 500,
            body: r#"{"code":500,"message":"Something went wrong."}"#,
        }],
        CREATED,
    );
    let recorder = Recorder::default();

    let outcome = uploader(transport.clone())
        .submit(book_request(), Arc::new(recorder.clone()))
        .await;

    let Err(UploadError::Server { status, message }) = outcome else {
        panic!("expected a server error, got {outcome:?}");
    };
    assert_eq!(status, 500);
    assert!(message.contains("Something went wrong."));
    assert_eq!(transport.calls(), 1);
    assert!(recorder.percents().iter().all(|&p| p < 100));
}

#[tokio::test]
async fn success_without_record_payload_is_a_server_error() {
    let transport = FakeTransport::always(Script::Respond {
        status: 204,
        body: "",
    });

    let outcome = uploader(transport.clone())
        .submit(book_request(), Arc::new(Recorder::default()))
        .await;

    assert!(matches!(outcome, Err(UploadError::Server { status: 204, .. })));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_in_flight_aborts_without_retry() {
    let transport = FakeTransport::always(Script::FailAfter(Duration::from_secs(5)));
    let recorder = Recorder::default();
    let session = uploader(transport.clone()).submit(book_request(), Arc::new(recorder.clone()));
    let cancel = session.cancel_handle();
    let task = tokio::spawn(session.into_future());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.calls(), 1);
    cancel.cancel();
    let outcome = task.await.unwrap();

    assert_eq!(outcome, Err(UploadError::Aborted));
    assert!(outcome.unwrap_err().is_aborted());
    let reports = recorder.reports().len();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.calls(), 1);
    assert_eq!(recorder.reports().len(), reports);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_stops_retries() {
    let transport = FakeTransport::always(Script::NetworkError);
    let session =
        uploader(transport.clone()).submit(book_request(), Arc::new(Recorder::default()));
    let cancel = session.cancel_handle();
    let task = tokio::spawn(session.into_future());

    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    assert_eq!(task.await.unwrap(), Err(UploadError::Aborted));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn cancel_before_start_makes_no_attempt() {
    let transport = FakeTransport::always(CREATED);
    let session =
        uploader(transport.clone()).submit(book_request(), Arc::new(Recorder::default()));
    session.cancel();

    assert_eq!(session.await, Err(UploadError::Aborted));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn cancel_after_success_is_a_no_op() {
    let transport = FakeTransport::always(CREATED);
    let recorder = Recorder::default();
    let session = uploader(transport.clone()).submit(book_request(), Arc::new(recorder.clone()));
    let cancel = session.cancel_handle();

    let uploaded = session.await.unwrap();
    cancel.cancel();

    assert!(cancel.is_cancelled());
    assert_eq!(uploaded.record.id(), Some("rec1"));
    assert_eq!(recorder.percents().last(), Some(&100));
}

#[tokio::test(start_paused = true)]
async fn hung_attempts_time_out_and_are_retried() {
    let transport = FakeTransport::new([Script::Hang], CREATED);
    let recorder = Recorder::default();
    let started = Instant::now();

    let uploaded = uploader(transport.clone())
        .submit(book_request(), Arc::new(recorder.clone()))
        .await
        .unwrap();

    assert_eq!(uploaded.attempts, 2);
    assert!(started.elapsed() >= Duration::from_secs(30 * 60 + 3));
    let statuses = recorder.statuses();
    assert_eq!(
        statuses,
        ["upload appears stalled", "retrying, attempt 2 of 4"]
    );
}

#[tokio::test(start_paused = true)]
async fn stall_is_informational_only() {
    let transport = FakeTransport::always(Script::Hang);
    let recorder = Recorder::default();
    let policy = UploadPolicy {
        max_retries: 0,
        ..Default::default()
    };
    let uploader = Uploader::new(transport.clone(), base_url(), AuthStore::default(), policy);
    let started = Instant::now();

    let outcome = uploader
        .submit(book_request(), Arc::new(recorder.clone()))
        .await;

    // the stall after 30s did not end the attempt, the 30 minute timeout did
    assert!(matches!(outcome, Err(UploadError::Network { attempts: 1, .. })));
    assert!(started.elapsed() >= Duration::from_secs(30 * 60));
    assert_eq!(recorder.statuses(), ["upload appears stalled"]);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn create_posts_to_collection_and_update_patches_record() {
    let transport = FakeTransport::always(CREATED);
    let uploader = uploader(transport.clone());

    uploader
        .submit(book_request(), Arc::new(Recorder::default()))
        .await
        .unwrap();
    uploader
        .submit(
            UploadRequest::update("books", "rec1").field("title", "Enchiridion"),
            Arc::new(Recorder::default()),
        )
        .await
        .unwrap();

    let attempts = transport.attempts();
    assert_eq!(attempts[0].method, Method::Post);
    assert_eq!(
        attempts[0].url.as_str(),
        "http://127.0.0.1:8090/api/collections/books/records"
    );
    assert_eq!(attempts[1].method, Method::Patch);
    assert_eq!(
        attempts[1].url.as_str(),
        "http://127.0.0.1:8090/api/collections/books/records/rec1"
    );
    assert_eq!(attempts[1].request.fields["title"], "Enchiridion");
}

#[tokio::test(start_paused = true)]
async fn credential_is_read_at_every_attempt() {
    let transport = FakeTransport::new([Script::NetworkError], CREATED);
    let auth = AuthStore::with_token("first");
    let refresher = auth.clone();
    let uploader = Uploader::new(
        transport.clone(),
        base_url(),
        auth.clone(),
        UploadPolicy::default(),
    );

    uploader
        .submit(
            book_request(),
            Arc::new(move |_: u8, status: Option<&str>| {
                if status.is_some_and(|status| status.starts_with("retrying")) {
                    refresher.set("second");
                }
            }),
        )
        .await
        .unwrap();

    let tokens = transport
        .attempts()
        .into_iter()
        .map(|attempt| attempt.authorization)
        .collect::<Vec<_>>();
    assert_eq!(tokens, [Some("first".into()), Some("second".into())]);
}

#[tokio::test]
async fn anonymous_upload_has_no_credential() {
    let transport = FakeTransport::always(CREATED);

    uploader(transport.clone())
        .submit(book_request(), Arc::new(Recorder::default()))
        .await
        .unwrap();

    assert_eq!(transport.attempts()[0].authorization, None);
}

#[tokio::test]
async fn invalid_base_url_is_a_precondition_error() {
    let transport = FakeTransport::always(CREATED);
    let base = url::Url::parse("mailto:admin@example.com").unwrap();
    let uploader = Uploader::new(
        transport.clone(),
        base,
        AuthStore::default(),
        UploadPolicy::default(),
    );

    let outcome = uploader
        .submit(book_request(), Arc::new(Recorder::default()))
        .await;

    assert!(matches!(
        outcome,
        Err(UploadError::Precondition(PreconditionError::InvalidBaseUrl(_)))
    ));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_cancel_handles_does_not_abort() {
    let transport = FakeTransport::new([Script::NetworkError], CREATED);
    let session = uploader(transport.clone()).submit(book_request(), Arc::new(Recorder::default()));
    drop(session.cancel_handle());

    let uploaded = session.await.unwrap();

    assert_eq!(uploaded.attempts, 2);
    assert_eq!(transport.calls(), 2);
}
