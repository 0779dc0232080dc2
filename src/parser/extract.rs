use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::DecodeError;
use super::frames::Frame;
use super::probe::probe_len;

const CONTEXT_MARKER: &str = r#"{"@context""#;
const WRAPPER_MARKER: &str = r#"{"dangerouslySetInnerHTML""#;
const ESCAPED_CONTEXT_MARKER: &str = r#"{\"@context\""#;

/// Id of the frame that carries the vendor's profile props.
pub const PROFILE_FRAME_ID: &str = "4";
const PROFILE_INDEX: usize = 3;

/// Result of looking for a record that may legitimately be missing from a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// Fields lifted from the JSON-LD site metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteMetadata {
    pub url: Option<String>,
}

/// Fields lifted from the vendor profile record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub facebook_url: Option<String>,
    pub instagram_url: Option<String>,
    pub team_members: IndexMap<String, Option<String>>,
}

/// Business facts for one vendor page. Missing keys are omitted when serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facebook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram_url: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub team_members: IndexMap<String, Option<String>>,
}

impl BusinessRecord {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.facebook_url.is_none()
            && self.instagram_url.is_none()
            && self.team_members.is_empty()
    }
}

/// Merge both lookups into one record. Failures only cost the affected fields.
pub fn extract_business_record(frames: &[Frame]) -> BusinessRecord {
    let mut record = BusinessRecord::default();

    match lookup_site_metadata(frames) {
        Ok(Lookup::Found(meta)) => record.url = meta.url,
        Ok(Lookup::NotFound) => debug!("No site metadata frame"),
        Err(e) => debug!("Failed to read site metadata: {}", e),
    }

    match lookup_profile(frames) {
        Ok(Lookup::Found(profile)) => {
            record.facebook_url = profile.facebook_url;
            record.instagram_url = profile.instagram_url;
            record.team_members = profile.team_members;
        }
        Ok(Lookup::NotFound) => debug!("No profile frame"),
        Err(e) => debug!("Failed to read profile: {}", e),
    }

    record
}

pub fn lookup_site_metadata(frames: &[Frame]) -> Result<Lookup<SiteMetadata>, DecodeError> {
    let Some(frame) = find_site_frame(frames) else {
        return Ok(Lookup::NotFound);
    };

    let data: Value = serde_json::from_str(&frame.value)?;
    Ok(Lookup::Found(SiteMetadata {
        url: non_empty_str(&data, "url"),
    }))
}

/// The JSON-LD frame, either as-is or unwrapped from an inline-HTML props object.
/// The unwrapped case yields a new frame; the decoded list is left untouched.
fn find_site_frame(frames: &[Frame]) -> Option<Frame> {
    if let Some(frame) = frames.iter().find(|f| f.value.starts_with(CONTEXT_MARKER)) {
        return Some(frame.clone());
    }

    frames.iter().find_map(|frame| {
        let at = frame.value.find(WRAPPER_MARKER)?;
        if !frame.value[at..].contains(ESCAPED_CONTEXT_MARKER) {
            return None;
        }
        match unwrap_inner_html(frame, at) {
            Ok(html) => Some(Frame {
                value: html,
                ..frame.clone()
            }),
            Err(e) => {
                debug!("Skipping wrapped metadata: {}", e);
                None
            }
        }
    })
}

/// The inline HTML of the props object starting at byte `at` of the frame's value.
fn unwrap_inner_html(frame: &Frame, at: usize) -> Result<String, DecodeError> {
    let wrapped = &frame.value[at..];
    let len = probe_len(wrapped).map_err(|source| DecodeError::Probe {
        id: frame.id.clone(),
        offset: at,
        source,
    })?;
    let obj: Value = serde_json::from_str(&wrapped[..len])?;
    obj.get("dangerouslySetInnerHTML")
        .and_then(|d| d.get("__html"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DecodeError::Shape {
            id: frame.id.clone(),
            reason: "no dangerouslySetInnerHTML.__html string",
        })
}

pub fn lookup_profile(frames: &[Frame]) -> Result<Lookup<Profile>, DecodeError> {
    let Some(frame) = frames.iter().find(|f| f.id == PROFILE_FRAME_ID) else {
        return Ok(Lookup::NotFound);
    };
    let shape = |reason| DecodeError::Shape {
        id: frame.id.clone(),
        reason,
    };

    let data: Value = serde_json::from_str(&frame.value)?;
    let holder = data
        .as_array()
        .ok_or_else(|| shape("profile frame is not an array"))?
        .get(PROFILE_INDEX)
        .ok_or_else(|| shape("profile array is too short"))?;

    let Some(pro) = holder.get("pro") else {
        return Ok(Lookup::Found(Profile::default()));
    };

    let team_members = pro
        .get("teamMembers")
        .and_then(Value::as_array)
        .map(|members| {
            members
                .iter()
                .filter_map(|m| {
                    let name = m.get("name")?.as_str()?.to_string();
                    let title = m.get("title").and_then(Value::as_str).map(str::to_string);
                    Some((name, title))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Lookup::Found(Profile {
        facebook_url: non_empty_str(pro, "facebookUrl"),
        instagram_url: non_empty_str(pro, "instagramUrl"),
        team_members,
    }))
}

fn non_empty_str(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::frames::decode_frames;
    use pretty_assertions::assert_eq;

    fn frame(id: &str, value: &str) -> Frame {
        Frame {
            id: id.into(),
            type_tag: String::new(),
            declared_length: None,
            value: value.into(),
        }
    }

    const PROFILE: &str = r#"["$","$L20",null,{"pro":{"facebookUrl":"https://facebook.com/acme","instagramUrl":"","teamMembers":[{"name":"Ann Lee","title":"Planner"},{"title":"Ghost"},{"name":"Bo Day","title":null},{"name":"Cy Ng","title":"Owner"}]}}]"#;

    #[test]
    fn single_profile_frame() {
        let buffer = "4:[null,null,null,{\"pro\":{\"facebookUrl\":\"https://fb.com/x\",\"teamMembers\":[{\"name\":\"Ann Lee\",\"title\":\"Planner\"}]}}]";
        let frames = decode_frames(buffer).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, "4");

        let record = extract_business_record(&frames);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "facebookUrl": "https://fb.com/x",
                "teamMembers": {"Ann Lee": "Planner"}
            })
        );
    }

    #[test]
    fn empty_frames_give_empty_record() {
        let record = extract_business_record(&[]);
        assert!(record.is_empty());
        assert_eq!(serde_json::to_string(&record).unwrap(), "{}");
    }

    #[test]
    fn profile_without_site_metadata() {
        let frames = vec![frame("1", "[1]"), frame("4", PROFILE)];
        assert_eq!(lookup_site_metadata(&frames).unwrap(), Lookup::NotFound);

        let record = extract_business_record(&frames);
        assert_eq!(record.url, None);
        assert_eq!(record.facebook_url.as_deref(), Some("https://facebook.com/acme"));
        assert_eq!(record.instagram_url, None);
        let names: Vec<&str> = record.team_members.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["Ann Lee", "Bo Day", "Cy Ng"]);
        assert_eq!(record.team_members["Bo Day"], None);
        assert_eq!(record.team_members["Cy Ng"].as_deref(), Some("Owner"));
    }

    #[test]
    fn site_metadata_without_profile() {
        let frames = vec![frame(
            "9",
            r#"{"@context":"https://schema.org","@type":"LocalBusiness","url":"https://acme.events"}"#,
        )];
        assert_eq!(lookup_profile(&frames).unwrap(), Lookup::NotFound);

        let record = extract_business_record(&frames);
        assert_eq!(record.url.as_deref(), Some("https://acme.events"));
        assert!(record.facebook_url.is_none());
        assert!(record.team_members.is_empty());
    }

    #[test]
    fn found_but_field_absent() {
        let frames = vec![frame("9", r#"{"@context":"https://schema.org"}"#)];
        assert_eq!(
            lookup_site_metadata(&frames).unwrap(),
            Lookup::Found(SiteMetadata { url: None })
        );
    }

    #[test]
    fn unwraps_inline_html_metadata() {
        let wrapped = r#"["$","script",null,{"dangerouslySetInnerHTML":{"__html":"{\"@context\":\"https://schema.org\",\"url\":\"https://wrapped.example\"}"}}]"#;
        let frames = vec![frame("c", wrapped)];

        let meta = lookup_site_metadata(&frames).unwrap().found().unwrap();
        assert_eq!(meta.url.as_deref(), Some("https://wrapped.example"));
        // The decoded frames are not modified.
        assert_eq!(frames[0].value, wrapped);
    }

    #[test]
    fn broken_wrapper_is_skipped() {
        let frames = vec![
            frame("c", r#"{"dangerouslySetInnerHTML":{"__html":"{\"@context\"" "#),
            frame("d", r#"{"dangerouslySetInnerHTML":{"__html":"{\"@context\":\"x\",\"url\":\"https://ok.example\"}"}}"#),
        ];
        let meta = lookup_site_metadata(&frames).unwrap().found().unwrap();
        assert_eq!(meta.url.as_deref(), Some("https://ok.example"));
    }

    #[test]
    fn wrapper_errors_name_the_frame() {
        let broken = frame("c", r#"[1,{"dangerouslySetInnerHTML":{"__html":"{\"@context\"" "#);
        let err = unwrap_inner_html(&broken, 3).unwrap_err();
        assert!(matches!(err, DecodeError::Probe { ref id, offset: 3, .. } if id == "c"));

        let no_html = frame("e", r#"{"dangerouslySetInnerHTML":{"raw":"{\"@context\""}}"#);
        let err = unwrap_inner_html(&no_html, 0).unwrap_err();
        assert!(matches!(err, DecodeError::Shape { ref id, .. } if id == "e"));
    }

    #[test]
    fn short_profile_array_is_an_error() {
        let frames = vec![frame("4", "[null]")];
        assert!(matches!(lookup_profile(&frames), Err(DecodeError::Shape { .. })));
        assert!(extract_business_record(&frames).is_empty());
    }

    #[test]
    fn profile_without_pro_is_found_and_empty() {
        let frames = vec![frame("4", "[null,null,null,{}]")];
        assert_eq!(lookup_profile(&frames).unwrap(), Lookup::Found(Profile::default()));
    }
}
