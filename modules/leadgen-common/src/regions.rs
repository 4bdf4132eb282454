/// Canonical form of a region code as typed on the command line.
pub fn normalize_region(region: &str) -> String {
    region.trim().to_ascii_uppercase()
}

/// ZIP bands that actually belong to a region. `None` means the region has no
/// known exclusions and every ZIP in a requested range is a candidate.
pub fn valid_zip_ranges(region: &str) -> Option<&'static [(u32, u32)]> {
    match normalize_region(region).as_str() {
        // 32000-39799 belongs to FL/AL/TN/MS; 398xx/399xx are Georgia again.
        "GA" => Some(&[(30000, 31999), (39800, 39999)]),
        _ => None,
    }
}

pub fn is_valid_zip(region: &str, zip: u32) -> bool {
    match valid_zip_ranges(region) {
        Some(ranges) => ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&zip)),
        None => zip <= 99_999,
    }
}

const REGION_NAMES: &[(&str, &str)] = &[
    ("AL", "Alabama"),
    ("AK", "Alaska"),
    ("AZ", "Arizona"),
    ("AR", "Arkansas"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("DC", "District of Columbia"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("HI", "Hawaii"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("IA", "Iowa"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("ME", "Maine"),
    ("MD", "Maryland"),
    ("MA", "Massachusetts"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MS", "Mississippi"),
    ("MO", "Missouri"),
    ("MT", "Montana"),
    ("NE", "Nebraska"),
    ("NV", "Nevada"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VT", "Vermont"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WV", "West Virginia"),
    ("WI", "Wisconsin"),
    ("WY", "Wyoming"),
];

/// Display name used for new tracker entries. Unknown codes fall back to the code.
pub fn region_name(region: &str) -> String {
    let code = normalize_region(region);
    REGION_NAMES
        .iter()
        .find(|(abbr, _)| *abbr == code)
        .map(|(_, name)| name.to_string())
        .unwrap_or(code)
}
