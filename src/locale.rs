//! Readable names for the numeric locale, language and country values
//! clients report in `OSInfo`.

use crate::record::get_path_mut;
use serde_json::{json, Map, Value};

pub const OS_INFO_PATH: &[&str] = &["DiagnosticInfo", "SystemInformation", "OSInfo"];

/// `(lcid_number, lcid_string, name)` for the locales seen most often.
const LOCALE_CODES: &[(u32, &str, &str)] = &[
    (0x0401, "ar-sa", "Arabic - Saudi Arabia"),
    (0x0801, "ar-iq", "Arabic - Iraq"),
    (0x0c01, "ar-eg", "Arabic - Egypt"),
    (0x0402, "bg", "Bulgarian"),
    (0x0403, "ca", "Catalan"),
    (0x0404, "zh-tw", "Chinese - Taiwan"),
    (0x0804, "zh-cn", "Chinese - China"),
    (0x0c04, "zh-hk", "Chinese - Hong Kong SAR"),
    (0x0405, "cs", "Czech"),
    (0x0406, "da", "Danish"),
    (0x0407, "de-de", "German - Germany"),
    (0x0408, "el", "Greek"),
    (0x0409, "en-us", "English - United States"),
    (0x0809, "en-gb", "English - Great Britain"),
    (0x0c09, "en-au", "English - Australia"),
    (0x1009, "en-ca", "English - Canada"),
    (0x040a, "es-es", "Spanish - Spain (Traditional)"),
    (0x080a, "es-mx", "Spanish - Mexico"),
    (0x040b, "fi", "Finnish"),
    (0x040c, "fr-fr", "French - France"),
    (0x0c0c, "fr-ca", "French - Canada"),
    (0x040d, "he", "Hebrew"),
    (0x040e, "hu", "Hungarian"),
    (0x0410, "it-it", "Italian - Italy"),
    (0x0411, "ja", "Japanese"),
    (0x0412, "ko", "Korean"),
    (0x0413, "nl-nl", "Dutch - Netherlands"),
    (0x0414, "nb-no", "Norwegian - Bokmal"),
    (0x0415, "pl", "Polish"),
    (0x0416, "pt-br", "Portuguese - Brazil"),
    (0x0816, "pt-pt", "Portuguese - Portugal"),
    (0x0418, "ro", "Romanian - Romania"),
    (0x0419, "ru", "Russian"),
    (0x041d, "sv-se", "Swedish - Sweden"),
    (0x041e, "th", "Thai"),
    (0x041f, "tr", "Turkish"),
    (0x0420, "ur", "Urdu"),
    (0x0421, "id", "Indonesian"),
    (0x0422, "uk", "Ukrainian"),
    (0x0423, "be", "Belarusian"),
    (0x0429, "fa", "Farsi - Persian"),
    (0x042a, "vi", "Vietnamese"),
    (0x0439, "hi", "Hindi"),
    (0x043e, "ms-my", "Malay - Malaysia"),
    (0x0443, "uz-uz", "Uzbek - Latin"),
    (0x0445, "bn", "Bengali - India"),
    (0x0455, "my", "Burmese"),
    (0x0463, "ps", "Pashto"),
    (0x048c, "prs", "Dari"),
];

/// `(dialing_code, country)`.
const COUNTRY_DIALING_CODES: &[(u32, &str)] = &[
    (1, "Canada"),
    (1, "United States"),
    (7, "Kazakhstan"),
    (7, "Russia"),
    (20, "Egypt"),
    (31, "Netherlands"),
    (33, "France"),
    (34, "Spain"),
    (39, "Italy"),
    (44, "United Kingdom"),
    (49, "Germany"),
    (52, "Mexico"),
    (55, "Brazil"),
    (60, "Malaysia"),
    (62, "Indonesia"),
    (63, "Philippines"),
    (66, "Thailand"),
    (81, "Japan"),
    (82, "South Korea"),
    (84, "Vietnam"),
    (86, "China"),
    (90, "Turkey"),
    (91, "India"),
    (92, "Pakistan"),
    (93, "Afghanistan"),
    (95, "Myanmar"),
    (98, "Iran"),
    (212, "Morocco"),
    (213, "Algeria"),
    (216, "Tunisia"),
    (218, "Libya"),
    (249, "Sudan"),
    (380, "Ukraine"),
    (375, "Belarus"),
    (852, "Hong Kong"),
    (880, "Bangladesh"),
    (886, "Taiwan"),
    (961, "Lebanon"),
    (962, "Jordan"),
    (963, "Syria"),
    (964, "Iraq"),
    (966, "Saudi Arabia"),
    (971, "United Arab Emirates"),
    (992, "Tajikistan"),
    (993, "Turkmenistan"),
    (998, "Uzbekistan"),
];

fn locale_entry(&(number, string, name): &(u32, &str, &str)) -> Value {
    json!({"lcid_number": number, "lcid_string": string, "name": name})
}

fn by_number(number: u32) -> Option<Value> {
    LOCALE_CODES
        .iter()
        .find(|(n, ..)| *n == number)
        .map(locale_entry)
}

fn by_string(lcid: &str) -> Option<Value> {
    LOCALE_CODES
        .iter()
        .find(|(_, s, _)| *s == lcid)
        .map(locale_entry)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// POSIX clients report `en_US`; everything else reports a hex LCID.
pub fn lookup_locale(locale: &str, posix: bool) -> Option<Value> {
    if posix {
        let lcid = locale.replace('_', "-").to_lowercase();
        by_string(&lcid).or_else(|| lcid.split('-').next().and_then(by_string))
    } else {
        u32::from_str_radix(locale, 16).ok().and_then(by_number)
    }
}

pub fn lookup_language(language: &Value) -> Option<Value> {
    let number = match language {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    by_number(number)
}

/// Several countries can share a code. A trailing extra digit is tolerated.
pub fn lookup_country(code: &str) -> Option<Value> {
    let find = |code: &str| -> Vec<Value> {
        COUNTRY_DIALING_CODES
            .iter()
            .filter(|(dialing, _)| dialing.to_string() == code)
            .map(|(dialing, country)| json!({"dialing_code": dialing, "country": country}))
            .collect()
    };
    let mut found = find(code);
    if found.is_empty() {
        if let Some((cut, _)) = code.char_indices().last().filter(|(cut, _)| *cut > 0) {
            found = find(&code[..cut]);
        }
    }
    (!found.is_empty()).then(|| Value::Array(found))
}

/// Adds `LocaleInfo`, `LanguageInfo` and `CountryCodeInfo` beside the raw
/// values. Unknown codes become `null`.
pub fn convert_locale_info(tree: &mut Value) {
    let Some(Value::Object(os_info)) = get_path_mut(tree, OS_INFO_PATH) else {
        return;
    };
    let posix = matches!(
        os_info.get("OS").and_then(Value::as_str),
        Some("darwin") | Some("linux")
    );

    if let Some(locale) = os_info.get("locale").and_then(as_text) {
        let info = lookup_locale(&locale, posix);
        insert_or_null(os_info, "LocaleInfo", info);
    }
    if let Some(language) = os_info.get("language").filter(|v| as_text(v).is_some()) {
        let info = lookup_language(language);
        insert_or_null(os_info, "LanguageInfo", info);
    }
    if let Some(code) = os_info.get("countryCode").and_then(as_text) {
        let info = lookup_country(&code);
        insert_or_null(os_info, "CountryCodeInfo", info);
    }
}

fn insert_or_null(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    map.insert(key.to_string(), value.unwrap_or(Value::Null));
}
