//! The HTML rewriting pipeline.
//!
//! Parse the upstream page, neutralize anything that interferes with
//! embedding, route every navigable URL back through the proxy, normalize
//! static-asset origins, and append the gesture-relay script. Anchor
//! classification needs real structure (ancestor/descendant checks, class
//! lists), so mutations are planned against the parsed tree and applied via
//! node ids, never by string surgery.

use ego_tree::NodeId;
use html5ever::tendril::StrTendril;
use html5ever::{local_name, namespace_url, ns, LocalName, QualName};
use scraper::node::{Element, Text};
use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use crate::config::DEFAULT_DESKTOP_BASE;
use crate::urls::page_proxy_url;

/// Gesture relay and link interception, appended to every rewritten page.
/// The payload is a stable artifact; its behavior is versioned through the
/// cache rewrite version.
const EMBED_SCRIPT: &str = include_str!("embed.js");

/// Hosts whose `/static/*` assets are served through the proxy's own
/// `/static` route instead of being wrapped.
const STATIC_HOSTS: [&str; 2] = ["en.wikipedia.org", "www.wikipedia.org"];

/// Anchor classes that mark image/media links; those keep their original
/// href so the upstream media overlay keeps working.
const MEDIA_CLASSES: [&str; 5] = [
    "image",
    "thumb",
    "thumbimage",
    "mwe-image",
    "mw-file-description",
];

/// `http-equiv` values that can break iframe embedding or script injection.
const NEUTRALIZED_HTTP_EQUIV: [&str; 3] = ["content-security-policy", "x-frame-options", "refresh"];

#[derive(Default)]
struct MutationPlan {
    removals: Vec<NodeId>,
    attr_edits: Vec<(NodeId, &'static str, String)>,
}

/// Rewrite one upstream HTML document resolved against `base_url`.
pub fn rewrite_html(html: &str, base_url: &Url) -> String {
    let mut doc = Html::parse_document(html);

    let mut plan = MutationPlan::default();
    collect_neutralizations(&doc, &mut plan);
    collect_anchor_rewrites(&doc, base_url, &mut plan);
    collect_asset_rewrites(&doc, base_url, &mut plan);
    collect_static_normalizations(&doc, &mut plan);
    collect_form_rewrites(&doc, base_url, &mut plan);
    apply(&mut doc, plan);
    inject_embed_script(&mut doc);

    serialize(&doc)
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// Remove `<meta http-equiv>` variants that block embedding, and `<base>`
/// so relative resolution stays ours.
fn collect_neutralizations(doc: &Html, plan: &mut MutationPlan) {
    if let Some(sel) = selector("meta[http-equiv]") {
        for el in doc.select(&sel) {
            let value = el
                .value()
                .attr("http-equiv")
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if NEUTRALIZED_HTTP_EQUIV.contains(&value.as_str()) {
                plan.removals.push(el.id());
            }
        }
    }
    if let Some(sel) = selector("base") {
        for el in doc.select(&sel) {
            plan.removals.push(el.id());
        }
    }
}

fn is_media_link(a: &ElementRef, abs: &Url, img_sel: &Selector) -> bool {
    if a.select(img_sel).next().is_some() {
        return true;
    }
    let path = abs.path();
    if path.starts_with("/wiki/File:")
        || path.starts_with("/wiki/Media:")
        || path.contains("/wiki/Special:FilePath/")
    {
        return true;
    }
    if a.value().classes().any(|c| MEDIA_CLASSES.contains(&c)) {
        return true;
    }
    a.value().attr("data-file").is_some()
}

/// Route every navigable anchor through `/m`, leaving fragments and
/// media links untouched.
fn collect_anchor_rewrites(doc: &Html, base_url: &Url, plan: &mut MutationPlan) {
    let (Some(sel_a), Some(sel_img)) = (selector("a[href]"), selector("img")) else {
        return;
    };
    for a in doc.select(&sel_a) {
        let href = a.value().attr("href").unwrap_or("").trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(abs) = base_url.join(href) else {
            continue;
        };
        if is_media_link(&a, &abs, &sel_img) {
            continue;
        }
        plan.attr_edits
            .push((a.id(), "href", page_proxy_url(abs.as_str())));
    }
}

/// Absolute target for a stylesheet/script-like attribute value, or None
/// when the value must stay as-is.
fn rewritten_asset_url(value: &str, base_url: &Url) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || v.starts_with('#') || v.starts_with("data:") || v.starts_with("javascript:")
    {
        return None;
    }
    let abs = if v.starts_with("/static/") {
        // Static assets live on the desktop origin, not the mobile one.
        Url::parse(DEFAULT_DESKTOP_BASE).ok()?.join(v).ok()?
    } else {
        base_url.join(v).ok()?
    };
    Some(page_proxy_url(abs.as_str()))
}

fn collect_asset_rewrites(doc: &Html, base_url: &Url, plan: &mut MutationPlan) {
    for (css, attr) in [("link[href]", "href"), ("script[src]", "src")] {
        let Some(sel) = selector(css) else { continue };
        for el in doc.select(&sel) {
            let value = el.value().attr(attr).unwrap_or("");
            if let Some(rewritten) = rewritten_asset_url(value, base_url) {
                plan.attr_edits.push((el.id(), attr, rewritten));
            }
        }
    }
}

/// Map an absolute (or protocol-relative) Wikipedia `/static/*` URL to the
/// root-relative form our own `/static` route serves. Anything else is left
/// for the upstream overlay machinery.
fn normalized_static_url(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || v.starts_with("/static/") {
        return None;
    }
    let candidate = if let Some(rest) = v.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        v.to_string()
    };
    let u = Url::parse(&candidate).ok()?;
    let host = u.host_str()?.to_ascii_lowercase();
    if !STATIC_HOSTS.contains(&host.as_str()) || !u.path().starts_with("/static/") {
        return None;
    }
    Some(match u.query() {
        Some(q) => format!("{}?{}", u.path(), q),
        None => u.path().to_string(),
    })
}

/// Apply [`normalized_static_url`] to the first token of each srcset
/// segment, preserving width/density descriptors and dropping empties.
fn normalized_srcset(value: &str) -> Option<String> {
    let mut out = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut segs: Vec<String> = part.split_whitespace().map(str::to_string).collect();
        if let Some(first) = segs.first_mut() {
            if let Some(normalized) = normalized_static_url(first) {
                *first = normalized;
            }
        }
        out.push(segs.join(" "));
    }
    let joined = out.join(", ");
    if joined == value {
        None
    } else {
        Some(joined)
    }
}

fn collect_static_normalizations(doc: &Html, plan: &mut MutationPlan) {
    for css in ["img", "source", "video", "audio"] {
        let Some(sel) = selector(css) else { continue };
        for el in doc.select(&sel) {
            if let Some(src) = el.value().attr("src") {
                if let Some(normalized) = normalized_static_url(src) {
                    plan.attr_edits.push((el.id(), "src", normalized));
                }
            }
            if matches!(css, "img" | "source") {
                if let Some(srcset) = el.value().attr("srcset") {
                    if let Some(normalized) = normalized_srcset(srcset) {
                        plan.attr_edits.push((el.id(), "srcset", normalized));
                    }
                }
            }
        }
    }
}

/// Search and edit forms submit back through the proxy.
fn collect_form_rewrites(doc: &Html, base_url: &Url, plan: &mut MutationPlan) {
    let Some(sel) = selector("form[action]") else {
        return;
    };
    for el in doc.select(&sel) {
        let action = el.value().attr("action").unwrap_or("").trim();
        if action.is_empty() {
            continue;
        }
        let Ok(abs) = base_url.join(action) else {
            continue;
        };
        plan.attr_edits
            .push((el.id(), "action", page_proxy_url(abs.as_str())));
    }
}

fn attr_name(local: &str) -> QualName {
    QualName::new(None, ns!(), LocalName::from(local))
}

fn apply(doc: &mut Html, plan: MutationPlan) {
    for (id, attr, value) in plan.attr_edits {
        if let Some(mut node) = doc.tree.get_mut(id) {
            if let Node::Element(el) = node.value() {
                el.attrs
                    .insert(attr_name(attr), StrTendril::from(value.as_str()));
            }
        }
    }
    for id in plan.removals {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn first_element_id(doc: &Html, css: &str) -> Option<NodeId> {
    let sel = selector(css)?;
    doc.select(&sel).next().map(|el| el.id())
}

/// Append the embed script as the last child of `<body>`, falling back to
/// `<head>` and then the document root.
fn inject_embed_script(doc: &mut Html) {
    let target = first_element_id(doc, "body")
        .or_else(|| first_element_id(doc, "head"))
        .unwrap_or_else(|| doc.tree.root().id());
    let element = Element::new(
        QualName::new(None, ns!(html), local_name!("script")),
        Vec::new(),
    );
    if let Some(mut parent) = doc.tree.get_mut(target) {
        let mut script = parent.append(Node::Element(element));
        script.append(Node::Text(Text {
            text: StrTendril::from(EMBED_SCRIPT),
        }));
    }
}

fn serialize(doc: &Html) -> String {
    let mut out = String::new();
    if doc
        .tree
        .root()
        .children()
        .any(|c| matches!(c.value(), Node::Doctype(_)))
    {
        out.push_str("<!DOCTYPE html>");
    }
    out.push_str(&doc.root_element().html());
    out
}
