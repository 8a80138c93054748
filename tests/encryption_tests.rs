use base64::Engine;
use forgebot::userconfig::encryption::{
    decrypt_value, encrypt_value, generate_key, resolve_key, EncryptedBlob,
};

fn key(byte: u8) -> [u8; 32] {
    [byte; 32]
}

#[test]
fn encrypt_then_decrypt_is_identity() {
    let key = key(7);
    for plaintext in ["secret-api-key", "x", "日本語のテキスト", "with\nnewlines"] {
        let sealed = encrypt_value(plaintext, &key).expect("encrypt");
        let opened = decrypt_value(&sealed, &key).expect("decrypt");
        assert_eq!(opened, plaintext);
    }
}

#[test]
fn encryption_is_nondeterministic_but_both_decrypt() {
    let key = key(7);
    let first = encrypt_value("same plaintext", &key).expect("encrypt");
    let second = encrypt_value("same plaintext", &key).expect("encrypt");
    assert_ne!(first, second);
    assert_eq!(decrypt_value(&first, &key).expect("decrypt"), "same plaintext");
    assert_eq!(decrypt_value(&second, &key).expect("decrypt"), "same plaintext");
}

#[test]
fn decrypt_with_wrong_key_fails_cleanly() {
    let sealed = encrypt_value("secret", &key(7)).expect("encrypt");
    assert!(decrypt_value(&sealed, &key(8)).is_err());
}

#[test]
fn tampered_payload_fails_cleanly() {
    let sealed = encrypt_value("secret", &key(7)).expect("encrypt");
    let mut raw = base64::engine::general_purpose::STANDARD
        .decode(&sealed)
        .expect("decode");
    let last = raw.len() - 1;
    raw[last] ^= 0xFF;
    let tampered = base64::engine::general_purpose::STANDARD.encode(raw);
    assert!(decrypt_value(&tampered, &key(7)).is_err());
}

#[test]
fn empty_plaintext_round_trips_as_empty() {
    let key = key(1);
    assert_eq!(encrypt_value("", &key).expect("encrypt"), "");
    assert_eq!(decrypt_value("", &key).expect("decrypt"), "");
}

#[test]
fn stored_layout_is_nonce_tag_ciphertext() {
    let sealed = encrypt_value("abc", &key(9)).expect("encrypt");
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&sealed)
        .expect("decode");
    // 12-byte nonce + 16-byte tag + 3 ciphertext bytes.
    assert_eq!(raw.len(), 12 + 16 + 3);

    let blob = EncryptedBlob::decode(&sealed).expect("decode blob");
    assert_eq!(blob.decrypt(&key(9)).expect("decrypt"), "abc");
}

#[test]
fn decode_rejects_truncated_input() {
    let short = base64::engine::general_purpose::STANDARD.encode([0u8; 10]);
    assert!(EncryptedBlob::decode(&short).is_err());
    assert!(EncryptedBlob::decode("not base64 !!!").is_err());
}

#[test]
fn generated_keys_are_32_bytes_of_base64() {
    let encoded = generate_key();
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&encoded)
        .expect("decode");
    assert_eq!(raw.len(), 32);
}

#[test]
fn resolved_key_is_always_32_bytes() {
    // Whatever the environment holds, the fallback path pads/truncates.
    let key = resolve_key();
    assert_eq!(key.len(), 32);
}
