// Tests for the CLI argument helpers

use maphound::parse_bbox;

// ============================================================================
// Bounding Box Parsing Tests
// ============================================================================

#[test]
fn test_parse_bbox_valid() {
    let bbox = parse_bbox("41.20,29.15,40.80,28.60").unwrap();
    assert_eq!(bbox.ne_lat, 41.20);
    assert_eq!(bbox.ne_lng, 29.15);
    assert_eq!(bbox.sw_lat, 40.80);
    assert_eq!(bbox.sw_lng, 28.60);
}

#[test]
fn test_parse_bbox_tolerates_spaces() {
    let bbox = parse_bbox("41.2, 29.15, 40.8, 28.6").unwrap();
    assert_eq!(bbox.ne_lat, 41.2);
    assert_eq!(bbox.sw_lng, 28.6);
}

#[test]
fn test_parse_bbox_negative_coordinates() {
    let bbox = parse_bbox("-33.40,-70.50,-33.60,-70.80").unwrap();
    assert_eq!(bbox.ne_lat, -33.40);
    assert_eq!(bbox.sw_lat, -33.60);
}

#[test]
fn test_parse_bbox_wrong_count() {
    assert!(parse_bbox("41.2,29.15,40.8").is_err());
    assert!(parse_bbox("41.2,29.15,40.8,28.6,1.0").is_err());
    assert!(parse_bbox("").is_err());
}

#[test]
fn test_parse_bbox_non_numeric() {
    let err = parse_bbox("41.2,north,40.8,28.6").unwrap_err();
    assert!(err.contains("north"));
}

#[test]
fn test_parse_bbox_inverted_corners() {
    // south-west corner given first
    assert!(parse_bbox("40.80,28.60,41.20,29.15").is_err());
}

#[test]
fn test_parse_bbox_degenerate_box() {
    assert!(parse_bbox("41.0,29.0,41.0,28.0").is_err());
}
