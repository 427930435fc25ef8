//! Client-bundle serialization: the fixed 1024-byte blob and its limits.

use std::io::Write;

use mirage_tunnel::{ClientConfig, Error, ServerConfig, CONFIG_DATA_LEN};

fn sample_client_config() -> ClientConfig {
    let server = ServerConfig::new("www.example.com:443", "127.0.0.1:4443").unwrap();
    let mut client = server.to_client_config(0x17).unwrap();
    client.finger_print = "firefox".into();
    client
}

#[test]
fn bundle_round_trip() {
    let config = sample_client_config();
    let data = config.marshal().unwrap();
    assert_eq!(data.len(), CONFIG_DATA_LEN);
    let restored = ClientConfig::unmarshal(&data).unwrap();
    assert_eq!(restored, config);
}

#[test]
fn bundle_is_zero_padded() {
    let data = sample_client_config().marshal().unwrap();
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    assert!(len > 0 && len <= CONFIG_DATA_LEN - 2);
    assert!(data[2 + len..].iter().all(|&b| b == 0));
}

#[test]
fn oversized_config_fails_marshal() {
    use rand::{distributions::Alphanumeric, Rng, SeedableRng};
    let mut config = sample_client_config();
    // incompressible filler blows past the 1022-byte compressed limit
    config.finger_print = rand::rngs::SmallRng::seed_from_u64(7)
        .sample_iter(&Alphanumeric)
        .take(4096)
        .map(char::from)
        .collect();
    assert!(matches!(
        config.marshal(),
        Err(Error::ConfigInvalid(msg)) if msg.contains("too large")
    ));
}

#[test]
fn length_field_1023_is_rejected() {
    let mut data = sample_client_config().marshal().unwrap();
    data[0..2].copy_from_slice(&1023u16.to_be_bytes());
    assert!(matches!(
        ClientConfig::unmarshal(&data),
        Err(Error::ConfigInvalid(msg)) if msg.contains("length")
    ));
}

#[test]
fn length_field_zero_is_rejected() {
    let mut data = sample_client_config().marshal().unwrap();
    data[0] = 0;
    data[1] = 0;
    assert!(ClientConfig::unmarshal(&data).is_err());
}

#[test]
fn truncated_blob_is_rejected() {
    assert!(ClientConfig::unmarshal(&[0x01]).is_err());
}

/// A compressed payload of exactly 1022 bytes is the largest legal bundle.
/// Stored (level-zero) zlib blocks make the compressed size predictable, so
/// the JSON can be padded to land exactly on the limit.
#[test]
fn compressed_length_exactly_1022_is_accepted() {
    let reference = sample_client_config();
    let json_for = |filler: usize| {
        format!(
            concat!(
                "{{\"server_addr\":\"{}\",\"sni_name\":\"{}\",",
                "\"public_key_ecdh\":\"{}\",\"public_key_verify\":\"{}\",",
                "\"filler\":\"{}\"}}"
            ),
            reference.server_addr,
            reference.sni_name,
            reference.public_key_ecdh,
            reference.public_key_verify,
            "x".repeat(filler),
        )
    };
    let compress = |json: &str| {
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::none());
        enc.write_all(json.as_bytes()).unwrap();
        enc.finish().unwrap()
    };

    // stored blocks add a content-independent overhead; measure it, then pad
    // the JSON so the compressed size is exactly 1022
    let probe = json_for(16);
    let overhead = compress(&probe).len() - probe.len();
    let target_json_len = 1022 - overhead;
    let filler = 16 + (target_json_len - probe.len());
    let zipped = compress(&json_for(filler));
    assert_eq!(zipped.len(), 1022);

    let mut data = vec![0u8; CONFIG_DATA_LEN];
    data[..2].copy_from_slice(&(zipped.len() as u16).to_be_bytes());
    data[2..2 + zipped.len()].copy_from_slice(&zipped);

    let restored = ClientConfig::unmarshal(&data).unwrap();
    assert_eq!(restored.server_addr, reference.server_addr);
    assert_eq!(restored.public_key_ecdh, reference.public_key_ecdh);
}
