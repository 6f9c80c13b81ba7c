use folio_contracts::{Scene, SceneStatus};

/// HTML comment keyed by scene id. Renders as pass-through block content.
pub fn placeholder_token(scene_id: u32) -> String {
    format!("<!--FOLIO_SCENE_{scene_id}_SLOT-->")
}

/// Status-aware markup for the in-app reader.
pub fn interactive_fragment(scene: &Scene) -> String {
    let id = scene.id;
    match (scene.status, scene.image_url.as_deref()) {
        (SceneStatus::Completed, Some(url)) => format!(
            concat!(
                r#"<figure class="folio-scene folio-scene--completed" data-scene-id="{id}">"#,
                r#"<img src="{src}" alt="{alt}" loading="lazy">"#,
                r#"<span class="folio-scene__badge">{id}</span>"#,
                r#"<button type="button" class="folio-scene__action" data-action="regenerate" data-scene-id="{id}">Regenerate</button>"#,
                "</figure>"
            ),
            id = id,
            src = escape_html(url),
            alt = escape_html(&alt_text(scene)),
        ),
        (SceneStatus::Error, _) => format!(
            concat!(
                r#"<div class="folio-scene folio-scene--error" data-scene-id="{id}" role="alert">"#,
                r#"<p class="folio-scene__message">Illustration {id} could not be generated.</p>"#,
                r#"<button type="button" class="folio-scene__action" data-action="retry" data-scene-id="{id}">Retry</button>"#,
                "</div>"
            ),
            id = id,
        ),
        (SceneStatus::Generating, _) => format!(
            concat!(
                r#"<div class="folio-scene folio-scene--generating" data-scene-id="{id}" aria-busy="true">"#,
                r#"<div class="folio-scene__spinner"></div>"#,
                r#"<p class="folio-scene__message">Painting illustration {id}…</p>"#,
                "</div>"
            ),
            id = id,
        ),
        _ => String::new(),
    }
}

/// Export markup: completed images only, inline styles, no controls.
pub fn clean_fragment(scene: &Scene) -> String {
    match (scene.status, scene.image_url.as_deref()) {
        (SceneStatus::Completed, Some(url)) => format!(
            concat!(
                r#"<div style="text-align:center;margin:2em 0;">"#,
                r#"<img src="{src}" alt="{alt}" style="max-width:100%;height:auto;border-radius:8px;box-shadow:0 4px 12px rgba(0,0,0,0.15);">"#,
                "</div>"
            ),
            src = escape_html(url),
            alt = escape_html(&alt_text(scene)),
        ),
        _ => String::new(),
    }
}

fn alt_text(scene: &Scene) -> String {
    let reasoning = scene.reasoning.trim();
    if reasoning.is_empty() {
        format!("Illustration {}", scene.id)
    } else {
        reasoning.to_string()
    }
}

pub(crate) fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
