pub const RESOURCES_PREFIX: &str = "resources";
pub const RUNNER_RESOURCE: &str = "main.js";

/// Artifact files a runner uploads under `<plan>/<site>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFile {
    SiteConsole,
    MeasureJob,
    PrimeJob,
    Plan,
    Consent,
}

impl ArtifactFile {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::SiteConsole => "console.json",
            Self::MeasureJob => "measure.json",
            Self::PrimeJob => "prime.json",
            Self::Plan => "plan.json",
            Self::Consent => "consent.json",
        }
    }

    pub fn classify(key: &str) -> Option<Self> {
        [
            Self::SiteConsole,
            Self::MeasureJob,
            Self::PrimeJob,
            Self::Plan,
            Self::Consent,
        ]
        .into_iter()
        .find(|kind| key.ends_with(kind.file_name()))
    }

    pub fn is_site_log(self) -> bool {
        matches!(self, Self::SiteConsole)
    }

    pub fn is_job_log(self) -> bool {
        matches!(self, Self::MeasureJob | Self::PrimeJob)
    }
}

pub fn resource_key(name: &str) -> String {
    format!("{RESOURCES_PREFIX}/{}", name.trim_start_matches('/'))
}

pub fn plan_part_key(plan_id: &str, part: &str) -> String {
    format!("{}/{part}.json", plan_id.trim_matches('/'))
}

pub fn artifact_key(id: &str, file_name: &str) -> String {
    format!("{}/{file_name}", id.trim_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_resource_key() {
        assert_eq!(resource_key("main.js"), "resources/main.js");
        assert_eq!(resource_key("/plans/eval.js"), "resources/plans/eval.js");
    }

    #[test]
    fn builds_plan_part_key() {
        assert_eq!(
            plan_part_key("eval/2021-10-20/plan-a/", "measure"),
            "eval/2021-10-20/plan-a/measure.json"
        );
    }

    #[test]
    fn builds_artifact_key() {
        assert_eq!(
            artifact_key("plan-a/site-1", ArtifactFile::SiteConsole.file_name()),
            "plan-a/site-1/console.json"
        );
    }

    #[test]
    fn classifies_log_artifacts() {
        let site = ArtifactFile::classify("plan/site/console.json").expect("should classify");
        assert!(site.is_site_log());
        let job = ArtifactFile::classify("plan/site/prime.json").expect("should classify");
        assert!(job.is_job_log());
        assert_eq!(ArtifactFile::classify("plan/site/screenshot.png"), None);
    }
}
