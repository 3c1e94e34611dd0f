use thiserror::Error;

const SUBSTITUTION_SITE: &str = "{domain}";

/// Versioned question shape. Templates are immutable; wording changes ship
/// under a new id so historical responses stay comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub id: &'static str,
    pub category: &'static str,
    pub body: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, hostname: &str) -> String {
        self.body.replace(SUBSTITUTION_SITE, hostname)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template body must contain exactly one {{domain}} site, found {0}")]
    SubstitutionCount(usize),
}

pub fn validate_body(body: &str) -> Result<(), TemplateError> {
    let count = body.matches(SUBSTITUTION_SITE).count();
    if count == 1 {
        Ok(())
    } else {
        Err(TemplateError::SubstitutionCount(count))
    }
}

pub const ACTIVE_TEMPLATES: [PromptTemplate; 3] = [
    PromptTemplate {
        id: "brand_memory_v1",
        category: "memory",
        body: "What do you know about the company or organization that operates the website {domain}? Describe what they do, their main products or services, and anything notable about their history or reputation.",
    },
    PromptTemplate {
        id: "brand_perception_v1",
        category: "perception",
        body: "How would you characterize the public perception and brand reputation of {domain}? Cover its strengths, weaknesses, and the audience it primarily serves.",
    },
    PromptTemplate {
        id: "brand_comparison_v1",
        category: "comparison",
        body: "Which companies or websites are the closest competitors of {domain}, and how does it compare to them in quality, pricing, and reach?",
    },
];

pub fn active_templates() -> &'static [PromptTemplate] {
    &ACTIVE_TEMPLATES
}

pub fn template(id: &str) -> Option<&'static PromptTemplate> {
    ACTIVE_TEMPLATES
        .iter()
        .find(|template| template.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_active_template_has_one_substitution_site() {
        for template in active_templates() {
            assert_eq!(validate_body(template.body), Ok(()), "{}", template.id);
        }
    }

    #[test]
    fn render_substitutes_the_hostname() {
        let rendered = ACTIVE_TEMPLATES[0].render("example.com");
        assert!(rendered.contains("example.com"));
        assert!(!rendered.contains("{domain}"));
    }

    #[test]
    fn validation_rejects_zero_and_multiple_sites() {
        assert_eq!(
            validate_body("no site here"),
            Err(TemplateError::SubstitutionCount(0))
        );
        assert_eq!(
            validate_body("{domain} vs {domain}"),
            Err(TemplateError::SubstitutionCount(2))
        );
    }

    #[test]
    fn lookup_by_id() {
        assert!(template("brand_memory_v1").is_some());
        assert!(template("brand_memory_v0").is_none());
    }
}
