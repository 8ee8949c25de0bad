mod job;
mod submit;
mod worker;

pub(crate) use job::job_show;
pub(crate) use submit::{SubmitArgs, submit_job};
pub(crate) use worker::run_worker;
