use serde::Serialize;

/// Stats from a pipeline run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    pub candidate_zips: u32,
    pub zips_processed: u32,
    pub zips_failed: u32,
    pub search_workers: u32,
    pub search_workers_failed: u32,
    pub records_written: u32,
    pub search_results_total: u32,
    pub search_results_added: u32,
    pub leads_without_website: u32,
    pub match_candidates: u32,
    pub matched: u32,
    pub unmatched: u32,
    pub session_restarts: u32,
    pub match_workers_failed: u32,
    pub final_leads_total: u32,
    pub final_leads_added: u32,
    pub watermark: Option<u32>,
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Lead Run Complete ===")?;
        writeln!(f, "ZIPs planned:       {}", self.candidate_zips)?;
        writeln!(f, "ZIPs processed:     {}", self.zips_processed)?;
        writeln!(f, "ZIPs failed:        {}", self.zips_failed)?;
        writeln!(
            f,
            "Search workers:     {} ({} failed)",
            self.search_workers, self.search_workers_failed
        )?;
        writeln!(f, "Records written:    {}", self.records_written)?;
        writeln!(
            f,
            "Search results:     {} (+{})",
            self.search_results_total, self.search_results_added
        )?;
        writeln!(f, "Without website:    {}", self.leads_without_website)?;
        writeln!(f, "\nDirectory matching:")?;
        writeln!(f, "  Candidates: {}", self.match_candidates)?;
        let looked_up = (self.matched + self.unmatched).max(1);
        writeln!(
            f,
            "  Matched:    {} ({:.0}%)",
            self.matched,
            self.matched as f64 / looked_up as f64 * 100.0
        )?;
        writeln!(f, "  Unmatched:  {}", self.unmatched)?;
        writeln!(f, "  Restarts:   {}", self.session_restarts)?;
        writeln!(
            f,
            "\nFinal leads:        {} (+{})",
            self.final_leads_total, self.final_leads_added
        )?;
        match self.watermark {
            Some(zip) => writeln!(f, "Last ZIP scraped:   {zip:05}"),
            None => writeln!(f, "Last ZIP scraped:   unchanged"),
        }
    }
}
