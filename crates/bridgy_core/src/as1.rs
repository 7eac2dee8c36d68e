/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Helpers over ActivityStreams 1 JSON as returned by silo adapters.

use crate::models::ResponseType;
use crate::urls;
use serde_json::{Map, Value};

/// RSVP verbs and the event collections they come from.
pub const RSVP_VERB_TO_COLLECTION: &[(&str, &str)] = &[
    ("rsvp-yes", "attending"),
    ("rsvp-no", "notAttending"),
    ("rsvp-maybe", "maybeAttending"),
    ("rsvp-interested", "interested"),
    ("invite", "invited"),
];

const PRUNE_KEEP: &[&str] = &["id", "url", "content", "fb_id", "fb_object_id", "fb_object_type"];
const PRUNE_RESPONSE_DROP: &[&str] = &["activity", "mentions", "originals", "replies", "tags"];
const CHANGE_FIELDS: &[&str] = &["objectType", "verb", "to", "content", "location", "image"];

/// A field as a list: arrays as-is, a single value as one element, null as empty.
pub fn get_list<'a>(obj: &'a Value, field: &str) -> Vec<&'a Value> {
    match obj.get(field) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(v) => vec![v],
    }
}

pub fn get_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// The activity's object, or the activity itself when it has none.
pub fn object_or_self(activity: &Value) -> &Value {
    match activity.get("object") {
        Some(obj @ Value::Object(_)) => obj,
        Some(Value::Array(items)) => items.first().filter(|o| o.is_object()).unwrap_or(activity),
        _ => activity,
    }
}

pub fn get_id(obj: &Value) -> Option<&str> {
    get_str(obj, "id")
}

/// First URL of an object: `url`, or the first `urls[].value`.
pub fn get_url(obj: &Value) -> Option<&str> {
    match obj.get("url") {
        Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim()),
        Some(Value::Object(o)) => {
            if let Some(s) = o.get("value").and_then(Value::as_str) {
                return Some(s.trim());
            }
        }
        _ => {}
    }
    get_list(obj, "urls")
        .into_iter()
        .find_map(|u| u.get("value").and_then(Value::as_str).or_else(|| u.as_str()))
        .map(str::trim)
}

/// Every URL an object declares about itself.
pub fn object_urls(obj: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for v in get_list(obj, "url") {
        if let Some(s) = v.as_str().or_else(|| v.get("value").and_then(Value::as_str)) {
            out.push(s.trim().to_string());
        }
    }
    for u in get_list(obj, "urls") {
        if let Some(s) = u.get("value").and_then(Value::as_str).or_else(|| u.as_str()) {
            out.push(s.trim().to_string());
        }
    }
    out.retain(|u| !u.is_empty());
    crate::models::dedupe(out)
}

pub fn author_id(obj: &Value) -> Option<&str> {
    obj.get("author")
        .and_then(|a| get_str(a, "id"))
        .or_else(|| obj.get("actor").and_then(|a| get_str(a, "id")))
}

/// Public unless `to` names an audience other than `@public` or `@unknown`.
pub fn is_public(activity: &Value) -> bool {
    let mut to = get_list(activity, "to");
    if to.is_empty() {
        to = get_list(object_or_self(activity), "to");
    }
    if to.is_empty() {
        return true;
    }
    to.iter()
        .filter_map(|t| t.get("alias").and_then(Value::as_str))
        .any(|alias| alias == "@public" || alias == "@unknown")
}

pub fn is_rsvp_verb(verb: &str) -> bool {
    RSVP_VERB_TO_COLLECTION.iter().any(|(v, _)| *v == verb)
}

/// The response type of an AS object. Anything unrecognized is a post.
pub fn get_type(obj: &Value) -> ResponseType {
    let object_type = get_str(obj, "objectType").unwrap_or_default();
    let verb = get_str(obj, "verb").unwrap_or_default();
    let has_reply = |o: &Value| !get_list(o, "inReplyTo").is_empty();

    if object_type == "activity" && verb == "share" {
        ResponseType::Repost
    } else if object_type == "issue" {
        ResponseType::Post
    } else if is_rsvp_verb(verb) {
        ResponseType::Rsvp
    } else if object_type == "comment"
        || has_reply(obj)
        || get_list(obj, "object")
            .into_iter()
            .chain(get_list(obj, "context"))
            .any(has_reply)
    {
        ResponseType::Comment
    } else if let Some(t) = ResponseType::from_verb(verb) {
        t
    } else {
        ResponseType::Post
    }
}

/// The ids of the posts this object replies to.
pub fn in_reply_to_ids(obj: &Value) -> Vec<String> {
    get_list(obj, "inReplyTo")
        .into_iter()
        .filter_map(|r| {
            r.get("id")
                .and_then(Value::as_str)
                .or_else(|| r.as_str())
                .map(str::to_string)
        })
        .collect()
}

/// Reduces an activity to the fields a stored response needs. `to` survives
/// only on non-public activities so the private marker isn't lost. Fields the
/// object repeats from the activity are dropped from the object.
pub fn prune_activity(activity: &Value) -> Value {
    let Some(map) = activity.as_object() else {
        return activity.clone();
    };
    let public = is_public(activity);
    let mut pruned = Map::new();
    for (k, v) in map {
        if PRUNE_KEEP.contains(&k.as_str()) || (!public && k == "to") {
            if !is_empty(v) {
                pruned.insert(k.clone(), v.clone());
            }
        }
    }

    if let Some(obj) = map.get("object").filter(|o| o.is_object()) {
        let mut obj = prune_activity(obj);
        if let Some(obj_map) = obj.as_object_mut() {
            obj_map.retain(|k, v| pruned.get(k) != Some(v));
            if !obj_map.is_empty() {
                pruned.insert("object".to_string(), obj);
            }
        }
    }
    Value::Object(pruned)
}

/// Drops the fields that can point back at the response's own activity.
pub fn prune_response(response: &Value) -> Value {
    let Some(map) = response.as_object() else {
        return response.clone();
    };
    let mut out = Map::new();
    for (k, v) in map {
        if PRUNE_RESPONSE_DROP.contains(&k.as_str()) || is_empty(v) {
            continue;
        }
        if k == "object" && v.is_object() {
            out.insert(k.clone(), prune_response(v));
        } else {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Whether two versions of an activity or response differ in a way that
/// should trigger re-sending webmentions.
pub fn activity_changed(before: &Value, after: &Value) -> bool {
    let changed = |b: &Value, a: &Value, field: &str| {
        let bv = b.get(field).filter(|v| !is_empty(v));
        let av = a.get(field).filter(|v| !is_empty(v));
        bv != av
    };
    if CHANGE_FIELDS.iter().any(|f| changed(before, after, f)) {
        return true;
    }
    let (ob, oa) = (object_or_self(before), object_or_self(after));
    if !std::ptr::eq(ob, before) || !std::ptr::eq(oa, after) {
        if CHANGE_FIELDS.iter().any(|f| changed(ob, oa, f)) {
            return true;
        }
    }
    in_reply_to_ids(before) != in_reply_to_ids(after)
}

/// Expands an event's attendee collections into RSVP activities.
pub fn rsvps_from_event(event: &Value) -> Vec<Value> {
    let Some((domain, event_id)) = get_id(event).and_then(urls::parse_tag_uri) else {
        return Vec::new();
    };
    let url = get_url(event).map(str::to_string);
    let author = event.get("author").cloned();

    let mut out = Vec::new();
    for (verb, collection) in RSVP_VERB_TO_COLLECTION {
        for actor in get_list(event, collection) {
            let mut rsvp = Map::new();
            rsvp.insert("objectType".into(), "activity".into());
            rsvp.insert("verb".into(), (*verb).into());
            if *verb == "invite" {
                rsvp.insert("object".into(), actor.clone());
                if let Some(author) = &author {
                    rsvp.insert("actor".into(), author.clone());
                }
            } else {
                rsvp.insert("actor".into(), actor.clone());
            }
            if let Some(url) = &url {
                rsvp.insert("url".into(), url.clone().into());
            }
            if let Some((_, actor_id)) = get_id(actor).and_then(urls::parse_tag_uri) {
                rsvp.insert(
                    "id".into(),
                    urls::tag_uri(&domain, &format!("{event_id}_rsvp_{actor_id}")).into(),
                );
                if let Some(url) = &url {
                    rsvp.insert("url".into(), format!("{url}#{actor_id}").into());
                }
            }
            out.push(Value::Object(rsvp));
        }
    }
    out
}
