//! Scripted SMTP conversations over the in-memory stream

use mxsend::{
    smtp::{
        client::{mock::MockStream, net::NetworkStream, SmtpConnection},
        ClientId, Conversation, SmtpConversation,
    },
    Address, FailureKind, SendState,
};
use pretty_assertions::assert_eq;

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

/// Opens a connection over `mock` and performs the greeting; the scripted
/// replies must start with the banner and the EHLO response
fn greeted(mock: &MockStream) -> SmtpConnection {
    let mut conn = SmtpConnection::new(NetworkStream::Mock(mock.clone()));
    conn.handshake(&ClientId::Domain("sender.example.com".to_owned()))
        .unwrap();
    mock.take_written();
    conn
}

#[test]
fn delivers_to_accepted_recipients_despite_one_rejection() {
    let mock = MockStream::with_reply(
        b"220 mx.example.com ESMTP\r\n\
          250 mx.example.com\r\n\
          250 sender ok\r\n\
          250 recipient ok\r\n\
          550 5.1.1 no such user\r\n\
          354 go ahead\r\n\
          250 2.0.0 queued\r\n\
          221 bye\r\n",
    );
    let conn = greeted(&mock);
    let mut conversation = SmtpConversation::new(conn, "mx.example.com");

    let mut state = SendState::fixed(
        "mx.example.com",
        vec![addr("good@example.com"), addr("bad@example.com")],
    );
    let group = state.next_group().unwrap();
    conversation.send_mail(
        &addr("noa@resare.com"),
        b"Subject: hi\r\n\r\n.leading dot\r\n",
        &group,
        &mut state,
    );

    let written = String::from_utf8(mock.take_written()).unwrap();
    assert_eq!(
        written,
        "MAIL FROM:<noa@resare.com>\r\n\
         RCPT TO:<good@example.com>\r\n\
         RCPT TO:<bad@example.com>\r\n\
         DATA\r\n\
         Subject: hi\r\n\r\n..leading dot\r\n\r\n.\r\n\
         QUIT\r\n"
    );

    let results = state.into_results();
    let delivery = results[&addr("good@example.com")].as_ref().unwrap();
    assert_eq!(delivery.server(), "mx.example.com");
    assert!(delivery.response().has_code(250));

    let failure = results[&addr("bad@example.com")].as_ref().unwrap_err();
    assert_eq!(failure.kind(), FailureKind::Permanent);
    assert_eq!(failure.code().map(u16::from), Some(550));
    assert_eq!(failure.server(), Some("mx.example.com"));
}

#[test]
fn rejected_sender_fails_the_whole_group() {
    let mock = MockStream::with_reply(
        b"220 mx.example.com ESMTP\r\n\
          250 mx.example.com\r\n\
          421 4.3.2 shutting down\r\n\
          221 bye\r\n",
    );
    let conn = greeted(&mock);
    let mut conversation = SmtpConversation::new(conn, "mx.example.com");

    let mut state = SendState::fixed(
        "mx.example.com",
        vec![addr("a@example.com"), addr("b@example.com")],
    );
    let group = state.next_group().unwrap();
    conversation.send_mail(&addr("noa@resare.com"), b"body", &group, &mut state);

    let results = state.into_results();
    for recipient in ["a@example.com", "b@example.com"] {
        let failure = results[&addr(recipient)].as_ref().unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Transient);
        assert_eq!(failure.code().map(u16::from), Some(421));
    }

    // no DATA was attempted
    let written = String::from_utf8(mock.take_written()).unwrap();
    assert_eq!(written, "MAIL FROM:<noa@resare.com>\r\nQUIT\r\n");
}

#[test]
fn all_recipients_rejected_skips_data() {
    let mock = MockStream::with_reply(
        b"220 mx.example.com ESMTP\r\n\
          250 mx.example.com\r\n\
          250 sender ok\r\n\
          550 5.1.1 no such user\r\n\
          221 bye\r\n",
    );
    let conn = greeted(&mock);
    let mut conversation = SmtpConversation::new(conn, "mx.example.com");

    let mut state = SendState::fixed("mx.example.com", vec![addr("bad@example.com")]);
    let group = state.next_group().unwrap();
    conversation.send_mail(&addr("noa@resare.com"), b"body", &group, &mut state);

    let written = String::from_utf8(mock.take_written()).unwrap();
    assert_eq!(
        written,
        "MAIL FROM:<noa@resare.com>\r\nRCPT TO:<bad@example.com>\r\nQUIT\r\n"
    );

    let results = state.into_results();
    let failure = results[&addr("bad@example.com")].as_ref().unwrap_err();
    assert_eq!(failure.kind(), FailureKind::Permanent);
}

#[test]
fn broken_connection_mid_conversation_fails_accepted_recipients() {
    // the reply stream ends after the RCPT responses, so DATA hits EOF
    let mock = MockStream::with_reply(
        b"220 mx.example.com ESMTP\r\n\
          250 mx.example.com\r\n\
          250 sender ok\r\n\
          250 recipient ok\r\n",
    );
    let conn = greeted(&mock);
    let mut conversation = SmtpConversation::new(conn, "mx.example.com");

    let mut state = SendState::fixed("mx.example.com", vec![addr("a@example.com")]);
    let group = state.next_group().unwrap();
    conversation.send_mail(&addr("noa@resare.com"), b"body", &group, &mut state);

    let results = state.into_results();
    let failure = results[&addr("a@example.com")].as_ref().unwrap_err();
    assert_eq!(failure.kind(), FailureKind::Network);
    assert_eq!(failure.code(), None);
}

#[test]
fn quit_goes_out_on_the_wire_then_blocks_further_commands() {
    let mock = MockStream::with_reply(
        b"220 mx.example.com ESMTP\r\n\
          250 mx.example.com\r\n\
          221 bye\r\n",
    );
    let mut conn = greeted(&mock);

    let response = conn.quit().unwrap();
    assert!(response.has_code(221));
    assert_eq!(String::from_utf8(mock.take_written()).unwrap(), "QUIT\r\n");

    // the conversation is over, nothing further reaches the wire
    let err = conn.quit().unwrap_err();
    assert!(err.is_client());
    assert!(mock.take_written().is_empty());
}

#[test]
fn handshake_falls_back_to_helo() {
    let mock = MockStream::with_reply(
        b"220 legacy.example.com\r\n\
          502 command not implemented\r\n\
          250 legacy.example.com\r\n",
    );
    let mut conn = SmtpConnection::new(NetworkStream::Mock(mock.clone()));
    let response = conn
        .handshake(&ClientId::Domain("sender.example.com".to_owned()))
        .unwrap();
    assert!(response.is_positive());

    let written = String::from_utf8(mock.take_written()).unwrap();
    assert_eq!(
        written,
        "EHLO sender.example.com\r\nHELO sender.example.com\r\n"
    );
}
