/// Bound a DICOM AgeString (e.g. `034Y`) to the 18-89 range.
///
/// Ages expressed in anything other than years carry more precision than a
/// de-identified dataset should, and map to the lower bound.
pub fn bounded_age(age: &str) -> String {
    let bytes = age.as_bytes();
    if bytes.len() != 4 || bytes[3] != b'Y' {
        return "018Y".to_string();
    }
    let Ok(years) = age[..3].parse::<u32>() else {
        return "018Y".to_string();
    };

    if years < 18 {
        "018Y".to_string()
    } else if years > 89 {
        "089Y".to_string()
    } else {
        age.to_string()
    }
}
