use super::*;

async fn read_all(input: &[u8]) -> Result<Vec<Command>, ProtoError> {
    let mut reader = ProtoReader::new(input);
    let mut commands = Vec::new();
    while let Some(cmd) = reader.next_command().await? {
        commands.push(cmd);
    }
    Ok(commands)
}

fn publish(topic: &str, qos: u8, payload: &'static [u8]) -> Command {
    Command::Publish {
        topic: topic.to_string(),
        qos,
        payload: Bytes::from_static(payload),
    }
}

#[tokio::test]
async fn test_parse_publish() {
    let commands = read_all(b"PUB sensors/a 1 5\nhello\n").await.unwrap();
    assert_eq!(commands, vec![publish("sensors/a", 1, b"hello")]);
}

#[tokio::test]
async fn test_encode_parses_back() {
    let cmd = publish("status/ok", 0, b"ok");
    assert_eq!(cmd.encode(), b"PUB status/ok 0 2\nok\n");
    assert_eq!(read_all(&cmd.encode()).await.unwrap(), vec![cmd]);
}

#[tokio::test]
async fn test_payload_with_embedded_newline() {
    let commands = read_all(b"PUB t 0 7\nab\ncd\n\n\nKILL t\n").await.unwrap();
    assert_eq!(
        commands,
        vec![
            publish("t", 0, b"ab\ncd\n\n"),
            Command::Kill {
                topic: "t".to_string()
            }
        ]
    );
}

#[tokio::test]
async fn test_trailing_newline_is_optional() {
    let commands = read_all(b"PUB a 0 1\nxPUB b 2 1\nyKILL c\n").await.unwrap();
    assert_eq!(
        commands,
        vec![
            publish("a", 0, b"x"),
            publish("b", 2, b"y"),
            Command::Kill {
                topic: "c".to_string()
            }
        ]
    );
}

#[tokio::test]
async fn test_keywords_are_case_insensitive() {
    let commands = read_all(b"pub t 3 0\n\nKiLl  other/topic \n").await.unwrap();
    assert_eq!(
        commands,
        vec![
            publish("t", 3, b""),
            Command::Kill {
                topic: "other/topic".to_string()
            }
        ]
    );
}

#[tokio::test]
async fn test_payload_split_across_reads() {
    let mock = tokio_test::io::Builder::new()
        .read(b"PUB sen")
        .read(b"sors/a 1 5\nhe")
        .read(b"l")
        .read(b"lo")
        .read(b"\nKILL sensors/a\n")
        .build();
    let mut reader = ProtoReader::new(mock);

    assert_eq!(
        reader.next_command().await.unwrap(),
        Some(publish("sensors/a", 1, b"hello"))
    );
    assert_eq!(
        reader.next_command().await.unwrap(),
        Some(Command::Kill {
            topic: "sensors/a".to_string()
        })
    );
    assert_eq!(reader.next_command().await.unwrap(), None);
}

#[tokio::test]
async fn test_late_newline_after_payload() {
    let mock = tokio_test::io::Builder::new()
        .read(b"PUB t 0 2\nok")
        .read(b"\nKILL t\n")
        .build();
    let mut reader = ProtoReader::new(mock);

    assert_eq!(
        reader.next_command().await.unwrap(),
        Some(publish("t", 0, b"ok"))
    );
    assert_eq!(
        reader.next_command().await.unwrap(),
        Some(Command::Kill {
            topic: "t".to_string()
        })
    );
    assert_eq!(reader.next_command().await.unwrap(), None);
}

#[tokio::test]
async fn test_end_of_stream_is_not_an_error() {
    assert!(read_all(b"").await.unwrap().is_empty());
    assert!(read_all(b"\n \n").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_qos_out_of_range() {
    let mut reader = ProtoReader::new(&b"PUB t 9 3\nabc"[..]);
    let err = reader.next_command().await.unwrap_err();
    assert!(matches!(err, ProtoError::InvalidQos(9)));
    assert_eq!(err.to_string(), "invalid QoS: 9");

    let err = read_all(b"PUB t -1 3\nabc").await.unwrap_err();
    assert!(matches!(err, ProtoError::InvalidQos(-1)));
}

#[tokio::test]
async fn test_unparsable_qos() {
    let err = read_all(b"PUB t high 3\nabc").await.unwrap_err();
    assert!(matches!(err, ProtoError::UnparsableQos(ref q) if q == "high"));
}

#[tokio::test]
async fn test_short_payload() {
    let err = read_all(b"PUB t 0 10\nabc").await.unwrap_err();
    assert!(matches!(
        err,
        ProtoError::ShortPayload {
            expected: 10,
            got: 3
        }
    ));
}

#[tokio::test]
async fn test_invalid_length() {
    let err = read_all(b"PUB t 0 ten\nabc").await.unwrap_err();
    assert!(matches!(err, ProtoError::InvalidLength(ref l) if l == "ten"));
}

#[tokio::test]
async fn test_unknown_command() {
    let err = read_all(b"SUB t\n").await.unwrap_err();
    assert!(matches!(err, ProtoError::UnknownCommand(ref c) if c == "SUB"));
}

#[tokio::test]
async fn test_missing_delimiters() {
    let err = read_all(b"KILL t").await.unwrap_err();
    assert!(matches!(err, ProtoError::UnexpectedEof { field: "topic" }));

    let err = read_all(b"PUB t 1").await.unwrap_err();
    assert!(matches!(err, ProtoError::UnexpectedEof { field: "QoS" }));

    let err = read_all(b"PUB t 1 4").await.unwrap_err();
    assert!(matches!(
        err,
        ProtoError::UnexpectedEof {
            field: "payload length"
        }
    ));
}

#[tokio::test]
async fn test_empty_topic() {
    let err = read_all(b"KILL \n").await.unwrap_err();
    assert!(matches!(err, ProtoError::EmptyTopic));
}

#[tokio::test]
async fn test_commands_before_error_are_returned() {
    let mut reader = ProtoReader::new(&b"KILL a\nBOGUS x\nKILL b\n"[..]);
    assert_eq!(
        reader.next_command().await.unwrap(),
        Some(Command::Kill {
            topic: "a".to_string()
        })
    );
    assert!(reader.next_command().await.is_err());
}

#[tokio::test]
async fn test_into_inner_keeps_stream_readable_after_error() {
    let stream = tokio_test::io::Builder::new()
        .read(b"BOGUS x\n")
        .read(b"PUB a 0 1\nx\n")
        .build();
    let mut reader = ProtoReader::new(stream);
    assert!(matches!(
        reader.next_command().await,
        Err(ProtoError::UnknownCommand(_))
    ));

    let mut rest = Vec::new();
    reader.into_inner().read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"PUB a 0 1\nx\n");
}

#[test]
fn test_display() {
    assert_eq!(publish("a/b", 1, b"hi").to_string(), "PUB a/b 1: hi");
    assert_eq!(
        Command::Kill {
            topic: "a/b".to_string()
        }
        .to_string(),
        "KILL a/b"
    );
}
