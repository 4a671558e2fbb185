//! Server-side HTML pages.
//!
//! Templates are compiled into the binary and registered once at startup;
//! a syntax error therefore fails the start, not a request.

use axum::response::Html;
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::json;

use crate::error::AppResult;
use crate::login::Role;

const PARTIALS: &[(&str, &str)] = &[
    ("header", include_str!("templates/header.hbs")),
    ("footer", include_str!("templates/footer.hbs")),
];

const PAGES: &[(&str, &str)] = &[
    ("login", include_str!("templates/login.hbs")),
    ("index", include_str!("templates/index.hbs")),
    ("saisie", include_str!("templates/saisie.hbs")),
    ("alerte", include_str!("templates/alerte.hbs")),
    ("confirmation", include_str!("templates/confirmation.hbs")),
    ("visualisation", include_str!("templates/visualisation.hbs")),
    ("rapport_form", include_str!("templates/rapport_form.hbs")),
    ("rapport_resultat", include_str!("templates/rapport_resultat.hbs")),
    ("rapports", include_str!("templates/rapports.hbs")),
    ("releve_20", include_str!("templates/releve_20.hbs")),
    ("voir_photos", include_str!("templates/voir_photos.hbs")),
    ("gestion_excel", include_str!("templates/gestion_excel.hbs")),
];

/// Context shared by every page: title and the navigation the role allows.
#[derive(Serialize)]
struct Page<'a, T> {
    title: &'a str,
    role: Option<&'static str>,
    can_photo: bool,
    can_manage: bool,
    #[serde(flatten)]
    body: &'a T,
}

pub struct Templates {
    registry: Handlebars<'static>,
}

impl Templates {
    pub fn new() -> AppResult<Self> {
        let mut registry = Handlebars::new();
        for (name, source) in PARTIALS {
            registry.register_partial(name, *source)?;
        }
        for (name, source) in PAGES {
            registry.register_template_string(name, *source)?;
        }
        Ok(Templates { registry })
    }

    /// Renders `page` with `body` merged into the shared page context.
    /// `body` must serialize to a map.
    pub fn render<T: Serialize>(
        &self,
        page: &str,
        title: &str,
        role: Option<Role>,
        body: &T,
    ) -> AppResult<Html<String>> {
        let context = Page {
            title,
            role: role.map(Role::label),
            can_photo: role.is_some_and(|r| r >= Role::Reader),
            can_manage: role.is_some_and(|r| r >= Role::Manager),
            body,
        };
        Ok(Html(self.registry.render(page, &context)?))
    }

    pub fn login(&self, error: Option<&str>) -> AppResult<Html<String>> {
        self.render("login", "Connexion", None, &json!({ "error": error }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_page_compiles() {
        let templates = Templates::new().unwrap();
        for (name, _) in PAGES {
            assert!(templates.registry.has_template(name), "{name}");
        }
    }

    #[test]
    fn login_shows_error() {
        let templates = Templates::new().unwrap();
        let Html(page) = templates.login(Some("Code d'accès incorrect.")).unwrap();
        assert!(page.contains("Code d&#x27;accès incorrect."));
        let Html(page) = templates.login(None).unwrap();
        assert!(page.contains("name=\"code\""));
        assert!(!page.contains("Déconnexion"));
    }

    #[test]
    fn navigation_follows_role() {
        let templates = Templates::new().unwrap();
        let body = json!({ "sites": ["SMP", "LPZ"] });

        let Html(page) = templates.render("index", "Accueil", Some(Role::Operator), &body).unwrap();
        assert!(page.contains("/saisie/LPZ"));
        assert!(page.contains("Déconnexion (Opérateur)"));
        assert!(!page.contains("/releve_20"));
        assert!(!page.contains("/rapport"));

        let Html(page) = templates.render("index", "Accueil", Some(Role::Manager), &body).unwrap();
        assert!(page.contains("/releve_20"));
        assert!(page.contains("/export_csv?site=SMP"));
    }
}
