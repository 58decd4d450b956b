#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::network::uid_range::{UidRangeMap, UidRanges};

// Fuzz the UID range parser and set algebra.
//
// Layout:
//   [0]    = split point between the two range lists (as a fraction)
//   [1..5] = probe uid
//   rest   = two comma-separated range lists
fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }
    let probe = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let Ok(text) = std::str::from_utf8(&data[5..]) else {
        return;
    };
    let split = text.len() * usize::from(data[0]) / 256;
    let (Some(left), Some(right)) = (text.get(..split), text.get(split..)) else {
        return;
    };
    let (Ok(a), Ok(b)) = (UidRanges::parse(left), UidRanges::parse(right)) else {
        return;
    };

    // Re-parsing the rendered form is lossless.
    assert_eq!(UidRanges::parse(&a.to_string()).ok(), Some(a.clone()));

    let union = a.union(&b);
    let diff = a.difference(&b);
    assert_eq!(union.has_uid(probe), a.has_uid(probe) || b.has_uid(probe));
    assert_eq!(diff.has_uid(probe), a.has_uid(probe) && !b.has_uid(probe));
    assert!(!diff.overlaps(&b));

    let mut map = UidRangeMap::new();
    map.add(&a, 10);
    map.add(&b, 5);
    let expected = if b.has_uid(probe) {
        Some(5)
    } else if a.has_uid(probe) {
        Some(10)
    } else {
        None
    };
    assert_eq!(map.applies_to_uid(probe), expected);

    map.remove(&b, 5);
    assert!(map.get(5).is_none());
});
