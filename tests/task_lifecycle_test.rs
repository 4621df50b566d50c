//! 任务生命周期集成测试

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use mantis::llm::MockLlmClient;
    use mantis::task::{
        ActionType, FileStorage, Manager, PhaseStatus, PlanRequest, Service, TaskManagerConfig,
        TaskStatus,
    };

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mantis-it-{}-{}", tag, Uuid::new_v4()))
    }

    fn plan_request(goal: &str) -> PlanRequest {
        PlanRequest {
            user_id: "u1".into(),
            session_id: "s1".into(),
            goal: goal.into(),
            context: String::new(),
            constraints: vec![],
            preferences: vec![],
        }
    }

    fn file_service(root: &PathBuf, llm: Arc<dyn mantis::llm::LlmClient>) -> Service {
        let storage = Arc::new(FileStorage::new(root).unwrap());
        let config = TaskManagerConfig {
            storage_path: root.clone(),
            ..TaskManagerConfig::default()
        };
        Service::with_storage(config, storage, llm)
    }

    // 规划 LLM 不可用时，创建任务回落到管理器的标准 5 阶段模板
    #[tokio::test]
    async fn test_plan_default_on_llm_unavailable() {
        let root = temp_root("plan-default");
        let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));

        let resp = service
            .create_task(
                &plan_request("实现一个任务管理系统"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(resp.phases.len(), 5);
        let names: Vec<&str> = resp.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Requirements & Discovery",
                "Planning & Structure",
                "Implementation",
                "Testing & Verification",
                "Delivery"
            ]
        );
        for phase in &resp.phases {
            assert_eq!(phase.status, PhaseStatus::Pending);
            assert_eq!(phase.steps.len(), 3);
        }

        let task = service.get_task(&resp.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.user_id, "u1");
        assert_eq!(task.session_id, "s1");

        std::fs::remove_dir_all(&root).ok();
    }

    // 规划输出不是合法 JSON 时，回落到规划器的中文默认计划
    #[tokio::test]
    async fn test_plan_default_on_parse_failure() {
        let root = temp_root("plan-parse");
        let service = file_service(&root, Arc::new(MockLlmClient::with_responses(["不是 JSON"])));

        let resp = service
            .create_task(
                &plan_request("实现一个任务管理系统"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(resp.phases.len(), 5);
        let names: Vec<&str> = resp.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["需求与发现", "规划与设计", "实现", "测试与验证", "交付"]);
        assert!(resp.phases.iter().all(|p| p.steps.len() == 3));

        std::fs::remove_dir_all(&root).ok();
    }

    // 阶段完成后自动晋升下一阶段
    #[tokio::test]
    async fn test_phase_promotion() {
        let root = temp_root("promotion");
        let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));
        let resp = service
            .create_task(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();

        service
            .update_phase(&resp.task_id, "phase_1", PhaseStatus::Complete)
            .unwrap();

        let task = service.get_task(&resp.task_id).unwrap().unwrap();
        assert_eq!(task.current_phase, "phase_2");
        assert_eq!(task.status, TaskStatus::InProgress);
        let phase2 = task.phase("phase_2").unwrap();
        assert_eq!(phase2.status, PhaseStatus::InProgress);
        assert!(phase2.started_at.is_some());

        std::fs::remove_dir_all(&root).ok();
    }

    // 逐个完成所有阶段后任务进入 completed
    #[tokio::test]
    async fn test_full_completion() {
        let root = temp_root("full");
        let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));
        let resp = service
            .create_task(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();

        for i in 1..=5 {
            service
                .update_phase(&resp.task_id, &format!("phase_{}", i), PhaseStatus::Complete)
                .unwrap();
        }

        let task = service.get_task(&resp.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());

        let status = service.check_completion(&resp.task_id).unwrap();
        assert!(status.complete);
        assert!(status.incomplete_phases.is_empty());
        assert!(status.can_stop);

        std::fs::remove_dir_all(&root).ok();
    }

    // 2 动作规则：查看类动作每 2 次触发一次 needs_save
    #[tokio::test]
    async fn test_two_action_rule() {
        let root = temp_root("two-action");
        let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));
        let resp = service
            .create_task(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!service
            .record_view_action(&resp.task_id, ActionType::View)
            .unwrap());
        assert!(service
            .record_view_action(&resp.task_id, ActionType::View)
            .unwrap());
        assert!(!service
            .record_view_action(&resp.task_id, ActionType::Write)
            .unwrap());

        std::fs::remove_dir_all(&root).ok();
    }

    // 重读阈值：第 threshold 次工具调用归零计数并置 needs_reread
    #[tokio::test]
    async fn test_tool_call_reread_threshold() {
        let root = temp_root("reread");
        let storage = Arc::new(FileStorage::new(&root).unwrap());
        let config = TaskManagerConfig {
            storage_path: root.clone(),
            reread_threshold: 3,
            ..TaskManagerConfig::default()
        };
        let manager = Manager::new(config, storage);
        let task = manager.create_task(&plan_request("目标")).unwrap();

        assert!(!manager.increment_tool_call_count(&task.id).unwrap());
        assert!(!manager.increment_tool_call_count(&task.id).unwrap());
        assert!(manager.increment_tool_call_count(&task.id).unwrap());

        let t = manager.get_task(&task.id).unwrap().unwrap();
        assert!(t.needs_reread);
        assert_eq!(t.tool_call_count, 0);

        std::fs::remove_dir_all(&root).ok();
    }

    // 3 次打击：LLM 持续失败的步骤记录 3 条错误并升级给用户
    #[tokio::test]
    async fn test_three_strike_escalation() {
        let root = temp_root("three-strike");
        let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));
        let resp = service
            .create_task(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();

        let exec = service
            .execute_task(
                &mantis::task::ExecuteRequest {
                    task_id: resp.task_id.clone(),
                    phase_id: String::new(),
                    step_id: String::new(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(exec.message.contains("请提供进一步指导"));

        let task = service.get_task(&resp.task_id).unwrap().unwrap();
        assert_eq!(task.errors.len(), 3);
        assert_eq!(
            task.errors.iter().map(|e| e.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        std::fs::remove_dir_all(&root).ok();
    }

    // 执行成功路径：mock 决策驱动任务到 completed，发现与决策落库
    #[tokio::test]
    async fn test_execute_task_to_completion() {
        let root = temp_root("execute");
        let decision = r#"{"action": "implement", "message": "步骤完成",
            "rationale": "按计划推进",
            "findings": [{"category": "technical", "content": "方案可行", "source": ""}]}"#;
        let service = file_service(&root, Arc::new(MockLlmClient::always(decision)));
        let resp = service
            .create_task(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();

        let exec = service
            .execute_task(
                &mantis::task::ExecuteRequest {
                    task_id: resp.task_id.clone(),
                    phase_id: String::new(),
                    step_id: String::new(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(exec.status, TaskStatus::Completed);

        let ctx = service.get_task_context(&resp.task_id).unwrap().unwrap();
        assert!(ctx.task.all_phases_complete());
        assert!(!ctx.task.decisions.is_empty());
        assert!(!ctx.findings.findings.is_empty());
        assert!(!ctx.progress.entries.is_empty());

        std::fs::remove_dir_all(&root).ok();
    }

    // 存储往返：重启（新建 Service）后上下文完整恢复
    #[tokio::test]
    async fn test_persistence_survives_restart() {
        let root = temp_root("restart");
        let resp = {
            let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));
            let resp = service
                .create_task(&plan_request("持久化目标"), &CancellationToken::new())
                .await
                .unwrap();
            service
                .add_decision(&resp.task_id, "用文件存储", "简单可靠")
                .unwrap();
            service
                .add_finding(&resp.task_id, "technical", "JSON 为权威格式", "")
                .unwrap();
            service
                .update_phase(&resp.task_id, "phase_1", PhaseStatus::Complete)
                .unwrap();
            resp
        };

        // 新 Service 模拟进程重启
        let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));
        let ctx = service.get_task_context(&resp.task_id).unwrap().unwrap();

        assert_eq!(ctx.task.goal, "持久化目标");
        assert_eq!(ctx.task.current_phase, "phase_2");
        assert_eq!(ctx.task.decisions.len(), 1);
        assert_eq!(ctx.findings.findings.len(), 1);
        assert!(!ctx.progress.entries.is_empty());

        std::fs::remove_dir_all(&root).ok();
    }

    // 稳定前缀：不同动态内容下系统提示字节一致
    #[tokio::test]
    async fn test_optimized_context_stable_prefix() {
        let root = temp_root("stable-prefix");
        let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));
        let resp = service
            .create_task(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();

        let first = service
            .get_optimized_context(&resp.task_id, &[], &CancellationToken::new())
            .await
            .unwrap();

        service
            .add_decision(&resp.task_id, "改变动态内容", "测试")
            .unwrap();
        let second = service
            .get_optimized_context(&resp.task_id, &[], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first.system_prompt, second.system_prompt);
        assert_ne!(first.task_context, second.task_context);

        std::fs::remove_dir_all(&root).ok();
    }

    // 删除任务：级联清除上下文
    #[tokio::test]
    async fn test_delete_task_cascades() {
        let root = temp_root("delete");
        let service = file_service(&root, Arc::new(MockLlmClient::unavailable()));
        let resp = service
            .create_task(&plan_request("目标"), &CancellationToken::new())
            .await
            .unwrap();

        service.delete_task(&resp.task_id).unwrap();
        assert!(service.get_task(&resp.task_id).unwrap().is_none());
        assert!(service.get_task_context(&resp.task_id).unwrap().is_none());

        std::fs::remove_dir_all(&root).ok();
    }
}
