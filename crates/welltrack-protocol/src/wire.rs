/// Tags understood on the worker's primary output stream.
///
/// Matching is exact and case-sensitive: a line belongs to a tag when it
/// equals the tag or starts with the tag followed by `:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireTag {
    TotalFiles,
    ProcessingFile,
    WellCompleted,
    Progress,
    UpdatedResult,
    CompleteResults,
    AnalysisComplete,
    Debug,
}

impl WireTag {
    pub const ALL: [WireTag; 8] = [
        WireTag::TotalFiles,
        WireTag::ProcessingFile,
        WireTag::WellCompleted,
        WireTag::Progress,
        WireTag::UpdatedResult,
        WireTag::CompleteResults,
        WireTag::AnalysisComplete,
        WireTag::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TotalFiles => "TOTAL_FILES",
            Self::ProcessingFile => "PROCESSING_FILE",
            Self::WellCompleted => "WELL_COMPLETED",
            Self::Progress => "PROGRESS",
            Self::UpdatedResult => "UPDATED_RESULT",
            Self::CompleteResults => "COMPLETE_RESULTS",
            Self::AnalysisComplete => "ANALYSIS_COMPLETE",
            Self::Debug => "DEBUG",
        }
    }

    /// Splits a line into its tag and payload when the tag is known.
    pub fn split_line(line: &str) -> Option<(WireTag, &str)> {
        Self::ALL.into_iter().find_map(|tag| {
            let rest = line.strip_prefix(tag.as_str())?;
            if rest.is_empty() {
                Some((tag, rest))
            } else {
                rest.strip_prefix(':').map(|payload| (tag, payload))
            }
        })
    }

    /// Renders a protocol line, newline included.
    pub fn line(self, payload: &str) -> String {
        format!("{}:{payload}\n", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::WireTag;

    #[test]
    fn split_line_requires_exact_tag_boundary() {
        assert_eq!(
            WireTag::split_line("PROGRESS:3/8"),
            Some((WireTag::Progress, "3/8"))
        );
        assert_eq!(
            WireTag::split_line("ANALYSIS_COMPLETE"),
            Some((WireTag::AnalysisComplete, ""))
        );
        assert_eq!(WireTag::split_line("PROGRESSIVE:3/8"), None);
        assert_eq!(WireTag::split_line("progress:3/8"), None);
    }
}
