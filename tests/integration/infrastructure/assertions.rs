use std::time::Duration;
use webprobe::http_probe::ProbeResponse;

/// Response and timing assertions for end-to-end tests

/// Assert a response carries exactly `expected`
pub fn assert_status(response: &ProbeResponse, expected: u16, context: &str) {
    assert_eq!(
        response.status.as_u16(),
        expected,
        "{}: expected {}, got {} (body: {:?})",
        context,
        expected,
        response.status,
        response.text()
    );
}

/// Assert a response status is one of `allowed`
pub fn assert_status_in(response: &ProbeResponse, allowed: &[u16], context: &str) {
    assert!(
        allowed.contains(&response.status.as_u16()),
        "{}: status {} not in {:?}",
        context,
        response.status,
        allowed
    );
}

/// Assert an elapsed time lies in `[min, max)`
pub fn assert_elapsed_within(actual: Duration, min: Duration, max: Duration, label: &str) {
    assert!(
        actual >= min && actual < max,
        "{} took {:?}, outside [{:?}, {:?})",
        label,
        actual,
        min,
        max
    );
}

/// Assert a header contains `needle` in at least one of its values
pub fn assert_header_contains(response: &ProbeResponse, name: &str, needle: &str) {
    let values = response.header_all(name);
    assert!(
        values.iter().any(|v| v.contains(needle)),
        "header {} should contain {:?}, got {:?}",
        name,
        needle,
        values
    );
}
