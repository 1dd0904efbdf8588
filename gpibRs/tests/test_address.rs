//! Tests for parsing, formatting, and comparing GPIB addresses.

use rstest::*;

use gpibrs::{GpibAddress, GpibError};

#[rstest]
#[case(0, 0, "gpib:0")]
#[case(5, 0, "gpib:5")]
#[case(30, 0, "gpib:30")]
#[case(5, 0x60, "gpib:5,96")]
#[case(12, 0x7E, "gpib:12,126")]
fn address_roundtrip(#[case] pad: u8, #[case] sad: u8, #[case] url: &str) {
    let addr = GpibAddress::try_new(pad, sad).unwrap();
    assert_eq!(addr.to_string(), url);

    let parsed: GpibAddress = url.parse().unwrap();
    assert_eq!(parsed.pad(), pad);
    assert_eq!(parsed.sad(), sad);
}

#[rstest]
fn address_roundtrip_all_valid() {
    let sads = std::iter::once(0).chain(0x60..=0x7E);
    for sad in sads {
        for pad in 0..=30 {
            let addr = GpibAddress::try_new(pad, sad).unwrap();
            let parsed: GpibAddress = addr.to_string().parse().unwrap();
            assert_eq!((parsed.pad(), parsed.sad()), (pad, sad));
        }
    }
}

#[rstest]
fn address_wildcard_equality() {
    let plain = GpibAddress::try_new(5, 0).unwrap();
    let sad61 = GpibAddress::try_new(5, 0x61).unwrap();
    let sad60 = GpibAddress::try_new(5, 0x60).unwrap();

    assert_eq!(plain, sad61);
    assert_eq!(sad61, plain);
    assert_ne!(sad60, sad61);
    assert_ne!(plain, GpibAddress::try_new(6, 0).unwrap());
}

#[rstest]
#[case(31, 0)]
#[case(5, 0x5F)]
#[case(5, 0x7F)]
#[case(5, 1)]
fn address_out_of_range(#[case] pad: u8, #[case] sad: u8) {
    assert!(matches!(
        GpibAddress::try_new(pad, sad),
        Err(GpibError::IntValueOutOfRange { .. })
    ));
}

#[rstest]
#[case("5")]
#[case("gpib:")]
#[case("gpib:x")]
#[case("gpib:5,")]
#[case("visa:5")]
fn address_parse_error(#[case] url: &str) {
    assert!(matches!(
        url.parse::<GpibAddress>(),
        Err(GpibError::AddressParse(_))
    ));
}

#[rstest]
fn address_parse_out_of_range() {
    assert!(matches!(
        "gpib:31".parse::<GpibAddress>(),
        Err(GpibError::IntValueOutOfRange { .. })
    ));
}
