//! Continental regions used to group weather results.
//!
//! OpenWeather reports an ISO 3166-1 alpha-2 country code, WeatherAPI an
//! IANA time zone; both are mapped onto the same five regions. Countries of
//! North and South America share one region. Anything else (Antarctica,
//! ocean time zones) has no region.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Europe,
    Asia,
    America,
    Africa,
    Oceania,
}

const AFRICA: &[&str] = &[
    "AO", "BF", "BI", "BJ", "BW", "CD", "CF", "CG", "CI", "CM", "CV", "DJ", "DZ", "EG", "EH",
    "ER", "ET", "GA", "GH", "GM", "GN", "GQ", "GW", "KE", "KM", "LR", "LS", "LY", "MA", "MG",
    "ML", "MR", "MU", "MW", "MZ", "NA", "NE", "NG", "RE", "RW", "SC", "SD", "SH", "SL", "SN",
    "SO", "SS", "ST", "SZ", "TD", "TG", "TN", "TZ", "UG", "YT", "ZA", "ZM", "ZW",
];

const ASIA: &[&str] = &[
    "AE", "AF", "AM", "AZ", "BD", "BH", "BN", "BT", "CC", "CN", "CX", "GE", "HK", "ID", "IL",
    "IN", "IO", "IQ", "IR", "JO", "JP", "KG", "KH", "KP", "KR", "KW", "KZ", "LA", "LB", "LK",
    "MM", "MN", "MO", "MV", "MY", "NP", "OM", "PH", "PK", "PS", "QA", "SA", "SG", "SY", "TH",
    "TJ", "TM", "TR", "TW", "UZ", "VN", "YE",
];

const EUROPE: &[&str] = &[
    "AD", "AL", "AT", "AX", "BA", "BE", "BG", "BY", "CH", "CY", "CZ", "DE", "DK", "EE", "ES",
    "FI", "FO", "FR", "GB", "GG", "GI", "GR", "HR", "HU", "IE", "IM", "IS", "IT", "JE", "LI",
    "LT", "LU", "LV", "MC", "MD", "ME", "MK", "MT", "NL", "NO", "PL", "PT", "RO", "RS", "RU",
    "SE", "SI", "SJ", "SK", "SM", "UA", "VA", "XK",
];

const AMERICA: &[&str] = &[
    "AG", "AI", "AR", "AW", "BB", "BL", "BM", "BO", "BQ", "BR", "BS", "BZ", "CA", "CL", "CO",
    "CR", "CU", "CW", "DM", "DO", "EC", "FK", "GD", "GF", "GL", "GP", "GT", "GY", "HN", "HT",
    "JM", "KN", "KY", "LC", "MF", "MQ", "MS", "MX", "NI", "PA", "PE", "PM", "PR", "PY", "SR",
    "SV", "SX", "TC", "TT", "UM", "US", "UY", "VC", "VE", "VG", "VI",
];

const OCEANIA: &[&str] = &[
    "AS", "AU", "CK", "FJ", "FM", "GU", "KI", "MH", "MP", "NC", "NF", "NR", "NU", "NZ", "PF",
    "PG", "PN", "PW", "SB", "TK", "TO", "TV", "VU", "WF", "WS",
];

impl Region {
    pub const ALL: [Region; 5] = [
        Region::Europe,
        Region::Asia,
        Region::America,
        Region::Africa,
        Region::Oceania,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Europe => "Europe",
            Region::Asia => "Asia",
            Region::America => "America",
            Region::Africa => "Africa",
            Region::Oceania => "Oceania",
        }
    }

    fn countries(&self) -> &'static [&'static str] {
        match self {
            Region::Europe => EUROPE,
            Region::Asia => ASIA,
            Region::America => AMERICA,
            Region::Africa => AFRICA,
            Region::Oceania => OCEANIA,
        }
    }

    /// Region of an ISO 3166-1 alpha-2 country code
    pub fn from_country_code(code: &str) -> Option<Region> {
        let code = code.trim().to_ascii_uppercase();
        Region::ALL
            .into_iter()
            .find(|region| region.countries().contains(&code.as_str()))
    }

    /// Region of an IANA time zone such as `Europe/London`
    pub fn from_time_zone(tz_id: &str) -> Option<Region> {
        match tz_id.split('/').next()? {
            "Europe" => Some(Region::Europe),
            "Asia" => Some(Region::Asia),
            "America" => Some(Region::America),
            "Africa" => Some(Region::Africa),
            "Australia" | "Pacific" => Some(Region::Oceania),
            _ => None,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = String;

    /// Case-insensitive region name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::ALL
            .into_iter()
            .find(|region| region.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid region: {}", s))
    }
}
