use super::*;

const MASTER_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";
const DEVICE_KEY: &str = "qcKEimuwHrdjqoaK3EkoOM5UR89lKAi2M1UbjbdNUNs=";

#[test]
fn compute_hmac_matches_reference_vector() {
    // HMAC-SHA256(key = "key", "The quick brown fox jumps over the lazy dog")
    let sig = compute_hmac("a2V5", "The quick brown fox jumps over the lazy dog").unwrap();
    assert_eq!(sig, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
}

#[test]
fn compute_hmac_rejects_non_base64_keys() {
    assert!(matches!(compute_hmac("not base64!", "x"), Err(SasError::InvalidKey(_))));
}

#[test]
fn derive_device_key_is_hmac_of_device_id() {
    assert_eq!(derive_device_key(MASTER_KEY, "sim-app-thermo-1").unwrap(), DEVICE_KEY);
}

#[test]
fn registration_token_has_all_fields_encoded() {
    let token =
        create_sas_token_at(DEVICE_KEY, "0ne000/registrations/sim-app-thermo-1", Some("registration"), 1_700_000_000)
            .unwrap();
    assert_eq!(
        token,
        "SharedAccessSignature sr=0ne000%2Fregistrations%2Fsim-app-thermo-1\
         &sig=UmX5bIUiaVFBCxSjxP0JDPguJmCC5Vkb%2Bwmefwl74Gg%3D&se=1700000000&skn=registration"
    );
}

#[test]
fn device_token_omits_key_name() {
    let token = create_sas_token_at(DEVICE_KEY, "hub/devices/d1", None, 10).unwrap();
    assert!(token.ends_with("&se=10"));
    assert!(!token.contains("skn="));
}

#[test]
fn create_sas_token_expires_in_the_future() {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let token = create_sas_token(DEVICE_KEY, "r", None, Duration::from_secs(60)).unwrap();
    let se: i64 = token.rsplit("se=").next().unwrap().parse().unwrap();
    assert!(se >= now + 59 && se <= now + 61);
}
