pub mod ss_reaper;
